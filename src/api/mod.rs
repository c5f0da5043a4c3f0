use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod handlers;
pub mod ws;

/// Build the lifecycle API router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tokens",
            get(handlers::list_tokens).post(handlers::create_token),
        )
        .route("/tokens/:id", get(handlers::get_token))
        .route("/tokens/:id/serve", post(handlers::serve_token))
        .route("/tokens/:id/skip", post(handlers::skip_token))
        .route("/tokens/:id/recall", post(handlers::recall_token))
        .route("/counters", get(handlers::list_counters))
        .route("/counters/:id/next", post(handlers::call_next))
        .route("/services", get(handlers::list_services))
        .route("/queue/resync", post(handlers::resync_queues))
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
}

/// Health probes, the real-time socket and the API, with state applied.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/ws", get(ws::ws_handler))
        .nest("/api/v1", api_router())
        .with_state(state)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Ready only while the fast store is reachable; lifecycle writes fail fast
/// otherwise.
async fn readiness_check(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.coordinator.stores().connection.is_connected() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "fast store unavailable")
    }
}
