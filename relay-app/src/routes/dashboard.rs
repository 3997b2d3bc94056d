use crate::server::RelayState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/logs", get(get_logs))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_stats(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "sessions": state.sessions.len(),
        "messages": state.dashboard.messages(),
        "uptime": state.dashboard.uptime().as_secs(),
        "start_time": state.dashboard.started_at(),
    }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_logs(
    Extension(state): Extension<Arc<RelayState>>,
) -> Json<Vec<crate::dashboard::ActivityEntry>> {
    Json(state.dashboard.logs())
}

#[cfg(test)]
mod tests {
    use crate::dashboard::Dashboard;
    use crate::server::{RelayState, build_app};
    use crate::session::SessionStore;
    use crate::session::tests::{EchoBackend, temp_sessions_path};
    use axum::body::{Body, to_bytes};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::header::AUTHORIZATION;
    use axum::http::{Request, StatusCode};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    async fn state() -> Arc<RelayState> {
        let sessions =
            Arc::new(SessionStore::load(temp_sessions_path(), Arc::new(EchoBackend::default())).await);
        sessions.bind("chat-1", "thread-1").await.expect("bind");
        let dashboard = Arc::new(Dashboard::new(10));
        dashboard.record_message();
        dashboard.info(Some("chat-1"), "received message: hi");
        Arc::new(RelayState { dashboard, sessions })
    }

    fn app(state: Arc<RelayState>, token: Option<&str>, peer: &str) -> axum::Router {
        let peer: SocketAddr = peer.parse().expect("socket addr");
        build_app(state, axum::Router::new(), token, Duration::from_secs(5), 8)
            .layer(MockConnectInfo(peer))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        serde_json::from_slice(&body).expect("response json")
    }

    #[tokio::test]
    async fn stats_report_counters() {
        let state = state().await;
        let response = app(state.clone(), None, "127.0.0.1:9000")
            .oneshot(Request::get("/api/stats").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = body_json(response).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["messages"], 1);
        assert!(body["uptime"].is_u64());
        assert!(body["start_time"].is_string());

        if let Some(dir) = state.sessions.path().parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn logs_return_activity_entries() {
        let state = state().await;
        let response = app(state.clone(), Some("secret"), "10.1.2.3:9000")
            .oneshot(
                Request::get("/api/logs")
                    .header(AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let entries = body.as_array().expect("array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["level"], "info");
        assert_eq!(entries[0]["chat_id"], "chat-1");

        if let Some(dir) = state.sessions.path().parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn api_is_guarded_but_index_is_public() {
        let state = state().await;
        let router = app(state.clone(), None, "203.0.113.7:9000");

        let denied = router
            .clone()
            .oneshot(Request::get("/api/stats").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(denied).await["error"], "unauthorized");

        let index = router
            .oneshot(Request::get("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(index.status(), StatusCode::OK);

        if let Some(dir) = state.sessions.path().parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
