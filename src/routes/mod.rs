pub mod broker;
mod error;
pub mod health;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
pub use error::{ErrorInfo, ErrorResponse};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{broker::Broker, config::ServerConfig};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

pub fn build_app(server: &ServerConfig, state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness))
        .route("/generate-request", post(broker::generate_request))
        .route("/translate-response", post(broker::translate_response))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(server.body_limit_bytes))
        .with_state(state)
}
