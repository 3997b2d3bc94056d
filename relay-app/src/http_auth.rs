use axum::Json;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::rejection::ExtensionRejection;
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use relay_core::policy::is_authorized;
use serde_json::json;
use std::net::SocketAddr;

/// Access policy for the dashboard API, installed as a request extension.
#[derive(Debug, Clone, Default)]
pub struct DashboardAuth {
    pub api_token: Option<String>,
}

impl DashboardAuth {
    pub fn new(api_token: Option<&str>) -> Self {
        Self {
            api_token: api_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        }
    }

    fn rejection_code(&self, auth_header: Option<&str>) -> &'static str {
        match (self.api_token.is_some(), auth_header) {
            (false, _) => "non_loopback_peer",
            (true, None) => "missing_bearer_token",
            (true, Some(_)) => "invalid_bearer_token",
        }
    }
}

fn unauthorized(code: &str) -> Response {
    tracing::warn!(error_code = code, "dashboard request rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "status": "error",
            "error": "unauthorized",
            "error_code": code,
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all, fields(path = %req.uri().path()))]
pub async fn require_dashboard_auth(
    connect_info: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let auth = req
        .extensions()
        .get::<DashboardAuth>()
        .cloned()
        .unwrap_or_default();
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let origin = connect_info.ok().map(|ConnectInfo(addr)| addr.ip());

    if is_authorized(header, auth.api_token.as_deref(), origin) {
        return next.run(req).await;
    }
    unauthorized(auth.rejection_code(header))
}
