use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::{broker::LevelOfAssurance, toolkit::KeyPair};

/// The identity hub authentication requests are addressed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// SSO endpoint requests are sent to. Never taken from metadata.
    pub sso_location: String,

    /// Encrypt the request extension for the hub before signing.
    #[serde(default = "default_true")]
    pub require_encryption: bool,

    /// Level of assurance requested when the caller does not specify one.
    #[serde(default)]
    pub level_of_assurance: LevelOfAssurance,

    /// Where the hub publishes its metadata.
    pub metadata: MetadataSourceConfig,
}

impl HubConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let location = url::Url::parse(&self.sso_location).map_err(|e| {
            ConfigError::Validation(format!(
                "hub.sso_location '{}' is not a valid URL: {e}",
                self.sso_location
            ))
        })?;
        if !matches!(location.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "hub.sso_location must use http or https, got '{}'",
                location.scheme()
            )));
        }
        self.metadata.validate("hub.metadata")
    }
}

fn default_true() -> bool {
    true
}

/// How metadata key material is trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureValidation {
    /// Every published certificate must chain to a configured trust certificate.
    #[default]
    Validated,
    /// Published certificates are used as-is.
    Unvalidated,
}

/// A remote metadata document backing one trust anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataSourceConfig {
    /// URL the metadata document is fetched from.
    pub uri: String,

    /// Entity id the document must assert.
    pub expected_entity_id: String,

    #[serde(default)]
    pub signature_validation: SignatureValidation,

    /// PEM trust roots, required when `signature_validation = "validated"`.
    #[serde(default)]
    pub trust_certificates: Vec<String>,

    /// Bound on one fetch-and-validate attempt.
    #[serde(default = "default_metadata_timeout")]
    pub timeout_secs: u64,

    /// Interval between background refreshes once the anchor is settled.
    /// Set to 0 to disable refreshing.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_metadata_timeout() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    600 // 10 minutes
}

impl MetadataSourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub(super) fn validate(&self, section: &str) -> Result<(), ConfigError> {
        url::Url::parse(&self.uri).map_err(|e| {
            ConfigError::Validation(format!("{section}.uri '{}' is not a valid URL: {e}", self.uri))
        })?;

        if self.expected_entity_id.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{section}.expected_entity_id must not be empty"
            )));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "{section}.timeout_secs must be greater than zero"
            )));
        }

        if self.signature_validation == SignatureValidation::Validated {
            if self.trust_certificates.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{section}.trust_certificates must not be empty when signature_validation = \"validated\""
                )));
            }
            for pem in &self.trust_certificates {
                openssl::x509::X509::from_pem(pem.as_bytes()).map_err(|e| {
                    ConfigError::Validation(format!(
                        "{section}.trust_certificates contains an invalid PEM certificate: {e}"
                    ))
                })?;
            }
        }

        Ok(())
    }
}

/// PEM-encoded private keys.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeysConfig {
    /// Key used to sign authentication requests.
    pub signing_key: String,

    /// Key tried first when decrypting assertions.
    pub primary_encryption_key: String,

    /// Key tried when the primary fails, typically the one being rotated out.
    #[serde(default)]
    pub secondary_encryption_key: Option<String>,
}

impl KeysConfig {
    pub fn signing_key_pair(&self) -> Result<KeyPair, ConfigError> {
        parse_key("keys.signing_key", &self.signing_key)
    }

    pub fn primary_encryption_key_pair(&self) -> Result<KeyPair, ConfigError> {
        parse_key("keys.primary_encryption_key", &self.primary_encryption_key)
    }

    pub fn secondary_encryption_key_pair(&self) -> Result<Option<KeyPair>, ConfigError> {
        self.secondary_encryption_key
            .as_deref()
            .map(|pem| parse_key("keys.secondary_encryption_key", pem))
            .transpose()
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        self.signing_key_pair()?;
        self.primary_encryption_key_pair()?;
        self.secondary_encryption_key_pair()?;
        Ok(())
    }
}

fn parse_key(field: &'static str, pem: &str) -> Result<KeyPair, ConfigError> {
    KeyPair::from_pem(pem).map_err(|e| ConfigError::Key {
        field,
        message: e.to_string(),
    })
}

impl std::fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysConfig")
            .field("signing_key", &"****")
            .field("primary_encryption_key", &"****")
            .field(
                "secondary_encryption_key",
                &self.secondary_encryption_key.as_ref().map(|_| "****"),
            )
            .finish()
    }
}
