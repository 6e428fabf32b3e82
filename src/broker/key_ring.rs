use crate::{
    config::{ConfigError, KeysConfig},
    toolkit::{EncryptedPayload, KeyPair, SamlToolkit, ToolkitError},
};

/// Decryption keys tried in a fixed order: primary, then secondary.
///
/// To rotate, deploy the new key as primary with the old key as secondary,
/// then drop the secondary once in-flight responses have expired.
#[derive(Debug, Clone)]
pub struct DecryptionKeyRing {
    primary: KeyPair,
    secondary: Option<KeyPair>,
}

impl DecryptionKeyRing {
    pub fn new(primary: KeyPair, secondary: Option<KeyPair>) -> Self {
        Self { primary, secondary }
    }

    pub fn from_config(keys: &KeysConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            keys.primary_encryption_key_pair()?,
            keys.secondary_encryption_key_pair()?,
        ))
    }

    pub fn primary(&self) -> &KeyPair {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&KeyPair> {
        self.secondary.as_ref()
    }

    /// Decrypt with the primary key, falling back to the secondary.
    ///
    /// Only [`ToolkitError::DecryptionFailed`] moves on to the next key; any
    /// other error is returned immediately.
    pub fn try_decrypt(
        &self,
        ciphertext: &EncryptedPayload,
        toolkit: &dyn SamlToolkit,
    ) -> Result<Vec<u8>, ToolkitError> {
        let primary_error = match toolkit.decrypt(ciphertext, &self.primary) {
            Ok(plaintext) => return Ok(plaintext),
            Err(ToolkitError::DecryptionFailed(message)) => message,
            Err(other) => return Err(other),
        };

        let Some(secondary) = &self.secondary else {
            return Err(ToolkitError::DecryptionFailed(primary_error));
        };

        tracing::debug!(error = %primary_error, "Primary decryption key failed, trying secondary");
        match toolkit.decrypt(ciphertext, secondary) {
            Ok(plaintext) => {
                tracing::info!("Decrypted with secondary key");
                Ok(plaintext)
            }
            Err(ToolkitError::DecryptionFailed(message)) => Err(ToolkitError::DecryptionFailed(
                format!("no configured key could decrypt: primary: {primary_error}; secondary: {message}"),
            )),
            Err(other) => Err(other),
        }
    }
}
