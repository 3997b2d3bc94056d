//! chatrelay server: channels, gateway and the dashboard API on one listener.

use crate::config::RelayConfig;
use crate::dashboard::Dashboard;
use crate::gateway::{Gateway, GatewaySettings};
use crate::http_auth::{self, DashboardAuth};
use crate::routes;
use crate::session::{SESSIONS_FILE_NAME, SessionStore};
use anyhow::Result;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::{Extension, Router};
use relay_assistant::{AssistantBackend, ResponsesBackend, ResponsesConfig};
use relay_channels::{ChannelAdapter, WEBCHAT_CHANNEL_ID, WebChatAdapter};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct RelayState {
    pub dashboard: Arc<Dashboard>,
    pub sessions: Arc<SessionStore>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let data_dir = cfg.runtime.data_dir_path()?;
    tracing::info!(
        model = %cfg.general.model,
        base_url = %cfg.general.base_url,
        reasoning_effort = ?cfg.general.reasoning_effort,
        api_key_configured = cfg.api_key().is_some(),
        bot_id_configured = cfg.bot_id().is_some(),
        webchat_enabled = cfg.channels.webchat.enabled,
        dashboard_addr = %cfg.dashboard.bind_addr()?,
        dashboard_token_configured = cfg.dashboard_api_token().is_some(),
        run_timeout_seconds = cfg.gateway.run_timeout_seconds,
        data_dir = %data_dir.display(),
        log_level = %cfg.runtime.log_level(),
        config_path = %path.display(),
        "config ok"
    );
    build_backend(&cfg)?;
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let addr = cfg.dashboard.bind_addr()?;
    let data_dir = cfg.runtime.data_dir_path()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        data_dir = %data_dir.display(),
        bind_addr = %addr,
        model = %cfg.general.model,
        bot_id_configured = cfg.bot_id().is_some(),
        webchat_enabled = cfg.channels.webchat.enabled,
        dedup_capacity = cfg.gateway.dedup_capacity,
        max_message_age_seconds = cfg.gateway.max_message_age_seconds,
        run_timeout_seconds = cfg.gateway.run_timeout_seconds,
        http_timeout_seconds = cfg.dashboard.http_timeout_seconds,
        http_max_in_flight = cfg.dashboard.http_max_in_flight,
        "server configuration loaded"
    );
    if !addr.ip().is_loopback() && cfg.dashboard_api_token().is_none() {
        tracing::warn!(%addr, "dashboard.api_token is not set; /api and /ws only answer loopback peers");
    }

    let backend = build_backend(&cfg)?;
    let listener = preflight_bind_listener(addr).await?;
    tokio::fs::create_dir_all(&data_dir).await?;

    let sessions = Arc::new(SessionStore::load(data_dir.join(SESSIONS_FILE_NAME), backend).await);
    tracing::info!(
        sessions_path = %sessions.path().display(),
        bindings = sessions.len(),
        "session store ready"
    );
    let dashboard = Arc::new(Dashboard::new(cfg.dashboard.max_logs));

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(cfg.gateway.inbound_buffer);
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    let mut channel_router = Router::new();
    if cfg.channels.webchat.enabled {
        let webchat = Arc::new(WebChatAdapter::new());
        webchat.start(inbound_tx.clone()).await?;
        channel_router = channel_router.merge(webchat.clone().router());
        channels.insert(WEBCHAT_CHANNEL_ID.to_string(), webchat);
    }
    drop(inbound_tx);
    if channels.is_empty() {
        tracing::warn!("no channels enabled; the gateway will receive nothing");
    }

    let gateway = Arc::new(Gateway::new(
        GatewaySettings {
            bot_id: cfg.bot_id().map(str::to_string),
            dedup_capacity: cfg.gateway.dedup_capacity,
            max_message_age: cfg.gateway.max_message_age(),
            run_timeout: cfg.gateway.run_timeout(),
            model: cfg.general.model.clone(),
        },
        sessions.clone(),
        dashboard.clone(),
        channels.clone(),
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(
        channel_count = channels.len(),
        channels = ?channels.keys().collect::<Vec<_>>(),
        "gateway started"
    );
    dashboard.info(None, "chatrelay started");

    let state = Arc::new(RelayState {
        dashboard,
        sessions,
    });
    let app = build_app(
        state,
        channel_router,
        cfg.dashboard_api_token(),
        Duration::from_secs(cfg.dashboard.http_timeout_seconds),
        cfg.dashboard.http_max_in_flight,
    );

    tracing::info!(%addr, "chatrelay serving");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

pub(crate) fn build_app(
    state: Arc<RelayState>,
    channel_router: Router,
    api_token: Option<&str>,
    http_timeout: Duration,
    http_max_in_flight: usize,
) -> Router {
    let api_router = routes::router()
        .layer(axum::middleware::from_fn(http_auth::require_dashboard_auth))
        .layer(Extension(DashboardAuth::new(api_token)))
        .layer(Extension(state));
    let channel_router = channel_router
        .layer(axum::middleware::from_fn(http_auth::require_dashboard_auth))
        .layer(Extension(DashboardAuth::new(api_token)));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::public_router()
        .merge(api_router)
        .merge(channel_router)
        .layer(GlobalConcurrencyLimitLayer::new(http_max_in_flight.max(1)))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            http_timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn build_backend(cfg: &RelayConfig) -> Result<Arc<dyn AssistantBackend>> {
    let api_key = cfg
        .api_key()
        .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY (or keys.openai_api_key) is required"))?;
    let backend = ResponsesBackend::new(ResponsesConfig {
        api_key,
        model: cfg.general.model.clone(),
        base_url: cfg.general.base_url.clone(),
        instructions: cfg.general.instructions.clone(),
        reasoning_effort: cfg.general.reasoning_effort,
    })?;
    tracing::info!(model = %backend.model(), "assistant backend ready");
    Ok(Arc::new(backend))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
