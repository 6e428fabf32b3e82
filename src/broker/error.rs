use crate::toolkit::{KeyUsage, ToolkitError};

/// Errors returned by broker operations.
///
/// Protocol-level rejections of a response are not errors; they are reported
/// as a [`TranslatedResponseOutcome`](super::TranslatedResponseOutcome).
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("Metadata unavailable for {anchor}: {message}")]
    MetadataUnavailable {
        anchor: &'static str,
        message: String,
    },

    #[error("No {usage} key found for entity {entity_id}")]
    NoKeyFound { entity_id: String, usage: KeyUsage },

    #[error("SAML toolkit failure: {0}")]
    Toolkit(ToolkitError),
}

impl BrokerError {
    /// Classify a toolkit error raised while using the `anchor` trust anchor.
    pub(crate) fn from_toolkit(anchor: &'static str, error: ToolkitError) -> Self {
        match error {
            ToolkitError::MetadataUnavailable(message) => {
                BrokerError::MetadataUnavailable { anchor, message }
            }
            ToolkitError::NoKeyFound { entity_id, usage } => {
                BrokerError::NoKeyFound { entity_id, usage }
            }
            other => BrokerError::Toolkit(other),
        }
    }

    /// Whether the failure lies with the trust infrastructure rather than
    /// the caller, and may succeed on retry.
    pub fn is_trust_infrastructure(&self) -> bool {
        matches!(
            self,
            BrokerError::MetadataUnavailable { .. } | BrokerError::NoKeyFound { .. }
        )
    }
}
