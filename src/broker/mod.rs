//! The broker core: entity id scope, trust anchors, request generation and
//! response translation.
//!
//! ```text
//! generate:  EntityIdScope -> AuthnRequestOrchestrator -> hub TrustAnchor -> toolkit encrypt/sign
//! translate: EntityIdScope -> ResponseOrchestrator -> MSA TrustAnchor -> DecryptionKeyRing -> ClockSkewPolicy
//! ```

mod authn_request;
mod clock_skew;
mod entity_id;
mod error;
mod health;
mod key_ring;
mod level_of_assurance;
mod response;
mod trust_anchor;

use std::sync::Arc;

pub use authn_request::{AuthnRequestOrchestrator, GeneratedAuthnRequest, HubRequestSettings};
pub use clock_skew::ClockSkewPolicy;
pub use entity_id::{EntityIdScope, Purpose};
pub use error::BrokerError;
pub use health::{HealthReport, TrustAnchorHealthMonitor};
pub use key_ring::DecryptionKeyRing;
pub use level_of_assurance::LevelOfAssurance;
pub use response::{
    AuthenticationErrorReason, NotAuthenticatedReason, ResponseOrchestrator,
    TranslatedResponseOutcome,
};
pub use trust_anchor::{AnchorHealth, HUB_METADATA, MSA_METADATA, TrustAnchor};

use crate::{
    config::{BrokerConfig, ConfigError},
    toolkit::{HttpMetadataLoader, MetadataLoader, OpensslToolkit, RawResponse, SamlToolkit},
};

/// The assembled broker.
///
/// All components are built once from configuration and shared read-only
/// between requests.
pub struct Broker {
    scope: Arc<EntityIdScope>,
    hub: Arc<TrustAnchor>,
    msa: Arc<TrustAnchor>,
    authn_requests: AuthnRequestOrchestrator,
    responses: ResponseOrchestrator,
    health: TrustAnchorHealthMonitor,
}

impl Broker {
    /// Build the broker with the production toolkit and HTTP metadata loader.
    pub fn from_config(config: &BrokerConfig) -> Result<Self, ConfigError> {
        let http_client = config
            .server
            .http_client
            .build_client()
            .map_err(|e| ConfigError::Validation(format!("Failed to build HTTP client: {e}")))?;

        Self::new(
            config,
            Arc::new(OpensslToolkit::new()),
            Arc::new(HttpMetadataLoader::with_client(http_client)),
        )
    }

    /// Build the broker with the given toolkit and metadata loader.
    pub fn new(
        config: &BrokerConfig,
        toolkit: Arc<dyn SamlToolkit>,
        loader: Arc<dyn MetadataLoader>,
    ) -> Result<Self, ConfigError> {
        let scope = Arc::new(EntityIdScope::from_config(
            config.service_entity_id.as_deref(),
            config.service_entity_ids.as_deref(),
        )?);

        let hub = Arc::new(TrustAnchor::new(
            HUB_METADATA,
            config.hub.metadata.clone(),
            loader.clone(),
        ));
        let msa = Arc::new(TrustAnchor::new(
            MSA_METADATA,
            config.msa_metadata.clone(),
            loader,
        ));

        let authn_requests = AuthnRequestOrchestrator::new(
            scope.clone(),
            hub.clone(),
            toolkit.clone(),
            config.keys.signing_key_pair()?,
            HubRequestSettings {
                sso_location: config.hub.sso_location.clone(),
                require_encryption: config.hub.require_encryption,
                default_level_of_assurance: config.hub.level_of_assurance,
            },
        );

        let responses = ResponseOrchestrator::new(
            scope.clone(),
            msa.clone(),
            toolkit,
            DecryptionKeyRing::from_config(&config.keys)?,
            ClockSkewPolicy::from_secs(config.clock_skew_secs),
        );

        let health = TrustAnchorHealthMonitor::new(vec![hub.clone(), msa.clone()]);

        tracing::info!(
            entity_ids = ?scope.configured_ids(),
            hub_metadata = %config.hub.metadata.uri,
            msa_metadata = %config.msa_metadata.uri,
            "SAML broker configured"
        );

        Ok(Self {
            scope,
            hub,
            msa,
            authn_requests,
            responses,
            health,
        })
    }

    pub fn entity_ids(&self) -> &[String] {
        self.scope.configured_ids()
    }

    pub async fn generate_request(
        &self,
        entity_id: Option<&str>,
        level_of_assurance: Option<LevelOfAssurance>,
    ) -> Result<GeneratedAuthnRequest, BrokerError> {
        self.authn_requests
            .generate(entity_id, level_of_assurance)
            .await
    }

    pub async fn translate_response(
        &self,
        raw: &RawResponse,
        entity_id: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<TranslatedResponseOutcome, BrokerError> {
        self.responses.translate(raw, entity_id, request_id).await
    }

    pub async fn check_health(&self) -> HealthReport {
        self.health.check().await
    }

    /// Initialize both trust anchors ahead of the first request.
    ///
    /// Failures are logged only; anchors retry on their next use.
    pub async fn warm_up(&self) {
        let (hub, msa) = futures::join!(self.hub.resolver(), self.msa.resolver());
        for (name, result) in [(HUB_METADATA, hub.err()), (MSA_METADATA, msa.err())] {
            if let Some(e) = result {
                tracing::warn!(anchor = name, error = %e, "Trust anchor not ready at startup");
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("entity_ids", &self.scope.configured_ids())
            .field("hub", &self.hub)
            .field("msa", &self.msa)
            .finish_non_exhaustive()
    }
}
