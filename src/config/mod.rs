//! Configuration module for the SAML broker.
//!
//! The broker is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! service_entity_id = "https://service.example.gov.uk/saml"
//! clock_skew_secs = 30
//!
//! [hub]
//! sso_location = "https://hub.example.gov.uk/SAML2/SSO"
//!
//! [hub.metadata]
//! uri = "https://hub.example.gov.uk/SAML2/metadata"
//! expected_entity_id = "https://hub.example.gov.uk"
//! trust_certificates = ["${HUB_TRUST_ROOT}"]
//!
//! [msa_metadata]
//! uri = "https://msa.example.gov.uk/matching-service/SAML2/metadata"
//! expected_entity_id = "https://msa.example.gov.uk"
//! signature_validation = "unvalidated"
//!
//! [keys]
//! signing_key = "${SAML_SIGNING_KEY}"
//! primary_encryption_key = "${SAML_PRIMARY_ENCRYPTION_KEY}"
//! ```

mod observability;
mod saml;
mod server;

use std::path::Path;

pub use observability::*;
pub use saml::*;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Root configuration for the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// The single entity id this broker acts for.
    #[serde(default)]
    pub service_entity_id: Option<String>,

    /// The entity ids this broker acts for, when it serves more than one.
    /// Mutually exclusive with `service_entity_id`.
    #[serde(default)]
    pub service_entity_ids: Option<Vec<String>>,

    /// Tolerance applied to assertion validity windows, in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// The identity hub requests are addressed to.
    pub hub: HubConfig,

    /// Metadata of the matching service adapter that signs responses.
    pub msa_metadata: MetadataSourceConfig,

    /// Signing and decryption key material.
    pub keys: KeysConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_clock_skew() -> u64 {
    30
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let config: BrokerConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    ///
    /// Key material and the entity id set are validated again when the
    /// broker is assembled, where they are parsed into their runtime types.
    fn validate(&self) -> Result<(), ConfigError> {
        crate::broker::EntityIdScope::from_config(
            self.service_entity_id.as_deref(),
            self.service_entity_ids.as_deref(),
        )?;

        self.hub.validate()?;
        self.msa_metadata.validate("msa_metadata")?;
        self.keys.validate()?;

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Entity id configuration error: {0}")]
    EntityIdConfiguration(String),

    #[error("Invalid key material in {field}: {message}")]
    Key { field: &'static str, message: String },
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("Invalid expansion pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            // Skip if this variable is inside a comment
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
