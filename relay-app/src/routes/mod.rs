pub mod dashboard;

use axum::Router;
use axum::routing::get;

pub fn router() -> Router {
    Router::new().merge(dashboard::router())
}

/// Routes outside `/api`, never behind dashboard auth.
pub fn public_router() -> Router {
    Router::new().route("/", get(index))
}

async fn index() -> &'static str {
    "chatrelay is running. Status API: GET /api/stats, GET /api/logs"
}
