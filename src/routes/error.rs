use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerError;

/// Error body returned by the broker's endpoints.
///
/// Format: `{"error": {"type": "...", "code": "...", "message": "..."}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error type classification (e.g., "invalid_request_error")
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn with_type(
        error_type: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorInfo {
                error_type: error_type.into(),
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = match &self {
            BrokerError::InvalidEntityId(message) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_entity_id",
                message.clone(),
            ),
            BrokerError::MetadataUnavailable { anchor, .. } => {
                tracing::warn!(error = %self, "Trust infrastructure unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service_unavailable",
                    "metadata_unavailable",
                    format!("Metadata for {anchor} is currently unavailable"),
                )
            }
            BrokerError::NoKeyFound { usage, .. } => {
                tracing::warn!(error = %self, "Trust infrastructure unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service_unavailable",
                    "no_key_found",
                    format!("No {usage} key is currently published"),
                )
            }
            // Toolkit detail stays in the logs
            BrokerError::Toolkit(_) => {
                tracing::error!(error = %self, "SAML processing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "saml_processing_failed",
                    "SAML processing failed".to_string(),
                )
            }
        };

        let body = ErrorResponse::with_type(error_type, code, message);
        (status, Json(body)).into_response()
    }
}
