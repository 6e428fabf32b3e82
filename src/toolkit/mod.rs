//! SAML processing toolkit.
//!
//! The broker core never touches XML or key material directly. Everything it
//! needs from SAML is expressed through two seams:
//!
//! - [`MetadataLoader`] fetches and validates a remote party's metadata,
//!   producing a [`MetadataSnapshot`] that a [`MetadataResolver`] keeps fresh.
//! - [`SamlToolkit`] signs, encrypts, decrypts, verifies and parses protocol
//!   messages.
//!
//! Production implementations are [`HttpMetadataLoader`] and
//! [`OpensslToolkit`]. Tests substitute their own loaders to observe the trust
//! anchor lifecycle without a network.

mod crypto;
mod metadata;
pub(crate) mod xml;

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
pub use crypto::{ECDSA_SHA256, OpensslToolkit, RSA_SHA256, simple_sign_content};
pub use metadata::{
    HttpMetadataLoader, MetadataHealth, MetadataResolver, MetadataSnapshot, fetch_with_timeout,
    parse_metadata,
};
use openssl::pkey::{PKey, Private, Public};

use crate::config::MetadataSourceConfig;

/// Errors signalled by toolkit operations.
///
/// Each operation fails with a small, closed set of these kinds so that
/// callers can classify failures instead of propagating opaque faults.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolkitError {
    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("No {usage} key found for entity {entity_id}")]
    NoKeyFound { entity_id: String, usage: KeyUsage },

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Malformed SAML document: {0}")]
    Malformed(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

impl From<openssl::error::ErrorStack> for ToolkitError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        ToolkitError::Crypto(e.to_string())
    }
}

/// The `use` attribute of a metadata key descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Signing,
    Encryption,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyUsage::Signing => f.write_str("signing"),
            KeyUsage::Encryption => f.write_str("encryption"),
        }
    }
}

/// A private key together with the public key derived from it.
///
/// The public half is computed once when the pair is built, never per call.
#[derive(Clone)]
pub struct KeyPair {
    private: PKey<Private>,
    public: PKey<Public>,
}

impl KeyPair {
    /// Derive a key pair from a private key.
    pub fn from_private_key(private: PKey<Private>) -> Result<Self, ToolkitError> {
        let public_der = private.public_key_to_der()?;
        let public = PKey::public_key_from_der(&public_der)?;
        Ok(Self { private, public })
    }

    /// Parse a PEM private key (PKCS#8 or PKCS#1) and derive its key pair.
    pub fn from_pem(pem: &str) -> Result<Self, ToolkitError> {
        let private = PKey::private_key_from_pem(pem.as_bytes()).map_err(|e| {
            ToolkitError::Crypto(format!(
                "Failed to parse private key (expected PEM format): {e}"
            ))
        })?;
        Self::from_private_key(private)
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_type", &self.private.id())
            .field("bits", &self.private.bits())
            .finish_non_exhaustive()
    }
}

/// Hybrid-encrypted content in the XML Encryption 1.1 layout.
///
/// `encrypted_key` is the RSA-OAEP wrapped content key and `cipher_value` is
/// `IV || ciphertext || tag` for AES-256-GCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub encrypted_key: Vec<u8>,
    pub cipher_value: Vec<u8>,
}

impl EncryptedPayload {
    pub fn encrypted_key_b64(&self) -> String {
        STANDARD.encode(&self.encrypted_key)
    }

    pub fn cipher_value_b64(&self) -> String {
        STANDARD.encode(&self.cipher_value)
    }
}

/// The unsigned content of an outbound authentication request.
#[derive(Debug, Clone)]
pub struct AuthnRequestEnvelope {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub destination: String,
    pub issuer: String,
    /// Authentication context class ref to request, if any.
    pub requested_authn_context: Option<String>,
    /// Extension attribute encrypted for the destination, if required.
    pub encrypted_extension: Option<EncryptedPayload>,
}

/// An authentication request encoded and signed for the HTTP-Redirect binding.
#[derive(Debug, Clone)]
pub struct SignedAuthnRequest {
    /// DEFLATE-compressed, base64-encoded request XML.
    pub saml_request: String,
    pub sig_alg: String,
    /// Base64 signature over the encoded query.
    pub signature: String,
}

impl SignedAuthnRequest {
    /// The signed query string: `SAMLRequest=..&SigAlg=..&Signature=..`.
    pub fn query(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("SAMLRequest", &self.saml_request)
            .append_pair("SigAlg", &self.sig_alg)
            .append_pair("Signature", &self.signature)
            .finish()
    }
}

/// An inbound response as posted with the HTTP-POST-SimpleSign binding.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Base64-encoded response XML.
    pub saml_response: String,
    pub relay_state: Option<String>,
    pub sig_alg: String,
    /// Base64 signature over the SimpleSign octet string.
    pub signature: String,
}

/// Top-level status of a response, with its optional second-level code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

/// The parsed outer response envelope.
#[derive(Debug, Clone)]
pub struct ResponseDocument {
    pub id: String,
    pub in_response_to: Option<String>,
    pub issuer: Option<String>,
    pub destination: Option<String>,
    pub status: ResponseStatus,
    pub encrypted_assertions: Vec<EncryptedPayload>,
}

/// The fields of a decrypted assertion the broker validates and translates.
#[derive(Debug, Clone, Default)]
pub struct ParsedAssertion {
    pub id: String,
    pub issuer: Option<String>,
    pub name_id: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub subject_confirmation_not_on_or_after: Option<DateTime<Utc>>,
    pub audiences: Vec<String>,
    pub authn_context_class_ref: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// Fetches and validates remote metadata.
#[async_trait]
pub trait MetadataLoader: Send + Sync {
    /// Fetch metadata for `source`, failing with
    /// [`ToolkitError::MetadataUnavailable`] when it cannot be obtained or
    /// does not validate.
    async fn resolve_metadata(
        &self,
        source: &MetadataSourceConfig,
    ) -> Result<MetadataSnapshot, ToolkitError>;
}

/// Cryptographic and parsing operations over SAML messages.
pub trait SamlToolkit: Send + Sync {
    /// Render, encode and sign an authentication request.
    fn sign(
        &self,
        envelope: &AuthnRequestEnvelope,
        key_pair: &KeyPair,
    ) -> Result<SignedAuthnRequest, ToolkitError>;

    /// Encrypt `payload` for the holder of `public_key`.
    fn encrypt(
        &self,
        payload: &[u8],
        public_key: &PKey<Public>,
    ) -> Result<EncryptedPayload, ToolkitError>;

    /// Decrypt `ciphertext` with `key_pair`, failing with
    /// [`ToolkitError::DecryptionFailed`] when the key does not match.
    fn decrypt(
        &self,
        ciphertext: &EncryptedPayload,
        key_pair: &KeyPair,
    ) -> Result<Vec<u8>, ToolkitError>;

    /// Verify the response signature against the resolver's signing keys.
    fn verify_signature(
        &self,
        response: &RawResponse,
        resolver: &MetadataResolver,
    ) -> Result<(), ToolkitError>;

    /// Extract the encryption key published for `expected_entity_id`.
    fn extract_public_key(
        &self,
        resolver: &MetadataResolver,
        expected_entity_id: &str,
    ) -> Result<PKey<Public>, ToolkitError>;

    /// Parse the outer response envelope.
    fn parse_response(&self, response: &RawResponse) -> Result<ResponseDocument, ToolkitError>;

    /// Parse a decrypted assertion.
    fn parse_assertion(&self, plaintext: &[u8]) -> Result<ParsedAssertion, ToolkitError>;
}
