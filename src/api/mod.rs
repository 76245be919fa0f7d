pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    // Every downstream call inherits this deadline through the request task.
    let request_timeout = Duration::from_secs(state.config.http.request_timeout_secs);

    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::export_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}
