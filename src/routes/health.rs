//! Health check endpoints for Kubernetes probes and monitoring.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::AppState;

/// Detailed health status response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy"
    pub status: String,
    /// Service version
    pub version: String,
    /// Individual trust anchor statuses
    pub anchors: Vec<ComponentStatus>,
}

/// Status of a single trust anchor.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentStatus {
    /// Anchor name, e.g. "hubMetadata"
    pub name: String,
    /// Whether the anchor is healthy
    pub healthy: bool,
    /// Details of the current metadata or the failure
    pub detail: String,
}

/// Full health check across both trust anchors.
///
/// An anchor that has never initialized is initialized here, so a probe can
/// bring the broker into a ready state.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.broker.check_health().await;

    let health = HealthStatus {
        status: if report.healthy {
            "healthy"
        } else {
            "unhealthy"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        anchors: report
            .anchors
            .into_iter()
            .map(|anchor| ComponentStatus {
                name: anchor.name.to_string(),
                healthy: anchor.healthy,
                detail: anchor.detail,
            })
            .collect(),
    };

    let status_code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Kubernetes liveness probe.
///
/// Returns 200 if the service is running.
#[tracing::instrument(name = "health.liveness")]
pub async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}
