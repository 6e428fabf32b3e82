use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{BrokerError, EntityIdScope, HUB_METADATA, LevelOfAssurance, Purpose, TrustAnchor};
use crate::toolkit::{AuthnRequestEnvelope, KeyPair, SamlToolkit};

/// Request settings taken from the hub configuration.
#[derive(Debug, Clone)]
pub struct HubRequestSettings {
    pub sso_location: String,
    pub require_encryption: bool,
    pub default_level_of_assurance: LevelOfAssurance,
}

/// A signed authentication request ready to be delivered to the hub.
#[derive(Debug, Clone)]
pub struct GeneratedAuthnRequest {
    pub request_id: String,
    pub issue_instant: DateTime<Utc>,
    pub destination: String,
    pub saml_request: String,
    pub sig_alg: String,
    pub signature: String,
    /// The signed HTTP-Redirect query string.
    pub signed_encoded_request: String,
}

impl GeneratedAuthnRequest {
    /// The destination with the signed query appended.
    pub fn redirect_url(&self) -> String {
        let separator = if self.destination.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}{}",
            self.destination, separator, self.signed_encoded_request
        )
    }
}

/// Builds authentication requests addressed to the hub.
pub struct AuthnRequestOrchestrator {
    scope: Arc<EntityIdScope>,
    hub: Arc<TrustAnchor>,
    toolkit: Arc<dyn SamlToolkit>,
    signing_key: KeyPair,
    settings: HubRequestSettings,
}

impl AuthnRequestOrchestrator {
    pub fn new(
        scope: Arc<EntityIdScope>,
        hub: Arc<TrustAnchor>,
        toolkit: Arc<dyn SamlToolkit>,
        signing_key: KeyPair,
        settings: HubRequestSettings,
    ) -> Self {
        Self {
            scope,
            hub,
            toolkit,
            signing_key,
            settings,
        }
    }

    /// Generate a signed request for `requested_entity_id`, or the default
    /// entity id when the scope has only one.
    #[tracing::instrument(name = "broker.generate_request", skip(self))]
    pub async fn generate(
        &self,
        requested_entity_id: Option<&str>,
        level_of_assurance: Option<LevelOfAssurance>,
    ) -> Result<GeneratedAuthnRequest, BrokerError> {
        let entity_id = self
            .scope
            .resolve(requested_entity_id, Purpose::RequestGeneration)?;

        let resolver = self
            .hub
            .resolver()
            .await
            .map_err(|e| BrokerError::from_toolkit(HUB_METADATA, e))?;
        let hub_key = self
            .toolkit
            .extract_public_key(&resolver, &self.hub.source().expected_entity_id)
            .map_err(|e| BrokerError::from_toolkit(HUB_METADATA, e))?;

        let level_of_assurance =
            level_of_assurance.unwrap_or(self.settings.default_level_of_assurance);

        let encrypted_extension = if self.settings.require_encryption {
            let extension = version_attribute();
            Some(
                self.toolkit
                    .encrypt(extension.as_bytes(), &hub_key)
                    .map_err(BrokerError::Toolkit)?,
            )
        } else {
            None
        };

        let envelope = AuthnRequestEnvelope {
            id: format!("_{}", uuid::Uuid::new_v4()),
            issue_instant: Utc::now(),
            destination: self.settings.sso_location.clone(),
            issuer: entity_id,
            requested_authn_context: Some(level_of_assurance.authn_context()),
            encrypted_extension,
        };

        let signed = self
            .toolkit
            .sign(&envelope, &self.signing_key)
            .map_err(BrokerError::Toolkit)?;

        tracing::info!(
            request_id = %envelope.id,
            issuer = %envelope.issuer,
            %level_of_assurance,
            encrypted = self.settings.require_encryption,
            "Generated authentication request"
        );

        Ok(GeneratedAuthnRequest {
            signed_encoded_request: signed.query(),
            request_id: envelope.id,
            issue_instant: envelope.issue_instant,
            destination: envelope.destination,
            saml_request: signed.saml_request,
            sig_alg: signed.sig_alg,
            signature: signed.signature,
        })
    }
}

/// The extension attribute announcing the broker version to the hub.
fn version_attribute() -> String {
    format!(
        r#"<saml:Attribute xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" Name="Versions"><saml:AttributeValue>{}</saml:AttributeValue></saml:Attribute>"#,
        env!("CARGO_PKG_VERSION")
    )
}
