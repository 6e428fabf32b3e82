//! Remote metadata: fetching, validation, and the refreshing resolver.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use openssl::{
    stack::Stack,
    x509::{X509, X509StoreContext, store::X509StoreBuilder},
};
use parking_lot::RwLock;
use samael::metadata::EntityDescriptor;
use tokio::time::MissedTickBehavior;

use super::{MetadataLoader, ToolkitError};
use crate::config::{MetadataSourceConfig, SignatureValidation};

/// Validated key material published by one remote party.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    /// Entity id asserted by the metadata document.
    pub entity_id: String,
    pub valid_until: Option<DateTime<Utc>>,
    pub signing_certificates: Vec<X509>,
    pub encryption_certificates: Vec<X509>,
    pub fetched_at: DateTime<Utc>,
}

/// Liveness of a resolver's current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHealth {
    pub healthy: bool,
    pub detail: String,
}

/// A long-lived handle over one remote party's metadata.
///
/// Request paths read the current snapshot through [`snapshot`](Self::snapshot);
/// a background task replaces it every `refresh_interval_secs`. A failed
/// refresh keeps serving the last good snapshot.
pub struct MetadataResolver {
    source: MetadataSourceConfig,
    loader: Arc<dyn MetadataLoader>,
    snapshot: RwLock<Arc<MetadataSnapshot>>,
    last_refresh_error: RwLock<Option<String>>,
}

impl MetadataResolver {
    pub fn new(
        source: MetadataSourceConfig,
        loader: Arc<dyn MetadataLoader>,
        snapshot: MetadataSnapshot,
    ) -> Self {
        Self {
            source,
            loader,
            snapshot: RwLock::new(Arc::new(snapshot)),
            last_refresh_error: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &MetadataSourceConfig {
        &self.source
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.snapshot.read().clone()
    }

    /// Re-fetch metadata, replacing the snapshot on success.
    pub async fn refresh(&self) -> Result<(), ToolkitError> {
        match fetch_with_timeout(self.loader.as_ref(), &self.source).await {
            Ok(snapshot) => {
                tracing::debug!(
                    uri = %self.source.uri,
                    entity_id = %snapshot.entity_id,
                    "Refreshed SAML metadata"
                );
                *self.snapshot.write() = Arc::new(snapshot);
                *self.last_refresh_error.write() = None;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    uri = %self.source.uri,
                    error = %e,
                    "SAML metadata refresh failed, keeping previous snapshot"
                );
                *self.last_refresh_error.write() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Evaluate the current snapshot without fetching anything.
    pub fn health(&self, now: DateTime<Utc>) -> MetadataHealth {
        let snapshot = self.snapshot();
        let expected = &self.source.expected_entity_id;

        if &snapshot.entity_id != expected {
            return MetadataHealth {
                healthy: false,
                detail: format!(
                    "Metadata asserts entity id {}, expected {expected}",
                    snapshot.entity_id
                ),
            };
        }

        if let Some(valid_until) = snapshot.valid_until
            && now >= valid_until
        {
            return MetadataHealth {
                healthy: false,
                detail: format!("Metadata for {expected} expired at {valid_until}"),
            };
        }

        if let Some(error) = self.last_refresh_error.read().as_ref() {
            return MetadataHealth {
                healthy: false,
                detail: format!(
                    "Metadata for {expected} fetched at {}; last refresh failed: {error}",
                    snapshot.fetched_at
                ),
            };
        }

        MetadataHealth {
            healthy: true,
            detail: format!("Metadata for {expected} fetched at {}", snapshot.fetched_at),
        }
    }

    /// Start refreshing in the background. The task stops once the resolver
    /// has been dropped.
    pub(crate) fn spawn_refresh(self: &Arc<Self>) {
        let interval = self.source.refresh_interval();
        if interval.is_zero() {
            return;
        }

        let resolver: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(resolver) = resolver.upgrade() else {
                    break;
                };
                let _ = resolver.refresh().await;
            }
        });
    }
}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataResolver")
            .field("uri", &self.source.uri)
            .field("entity_id", &self.snapshot().entity_id)
            .finish_non_exhaustive()
    }
}

/// Run `loader` against `source`, bounded by the source's timeout.
pub async fn fetch_with_timeout(
    loader: &dyn MetadataLoader,
    source: &MetadataSourceConfig,
) -> Result<MetadataSnapshot, ToolkitError> {
    let timeout = source.timeout();
    match tokio::time::timeout(timeout, loader.resolve_metadata(source)).await {
        Ok(result) => result,
        Err(_) => Err(ToolkitError::MetadataUnavailable(format!(
            "Timed out after {}ms fetching {}",
            timeout.as_millis(),
            source.uri
        ))),
    }
}

/// Fetches metadata over HTTP(S) and validates it with `samael` and OpenSSL.
#[derive(Debug, Clone)]
pub struct HttpMetadataLoader {
    http_client: reqwest::Client,
}

impl HttpMetadataLoader {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    /// Create a loader with a custom HTTP client.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

impl Default for HttpMetadataLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataLoader for HttpMetadataLoader {
    async fn resolve_metadata(
        &self,
        source: &MetadataSourceConfig,
    ) -> Result<MetadataSnapshot, ToolkitError> {
        tracing::debug!(url = %source.uri, "Fetching SAML metadata");

        let response = self
            .http_client
            .get(&source.uri)
            .timeout(source.timeout())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %source.uri, "Failed to fetch SAML metadata");
                ToolkitError::MetadataUnavailable(format!("Failed to fetch metadata: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, url = %source.uri, "SAML metadata endpoint returned error");
            return Err(ToolkitError::MetadataUnavailable(format!(
                "Metadata endpoint returned {status}"
            )));
        }

        let metadata_xml = response.text().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to read SAML metadata response");
            ToolkitError::MetadataUnavailable(format!("Failed to read metadata: {e}"))
        })?;

        parse_metadata(&metadata_xml, source, Utc::now())
    }
}

/// Parse and validate a metadata document for `source`.
pub fn parse_metadata(
    metadata_xml: &str,
    source: &MetadataSourceConfig,
    now: DateTime<Utc>,
) -> Result<MetadataSnapshot, ToolkitError> {
    let entity_descriptor: EntityDescriptor = samael::metadata::de::from_str(metadata_xml)
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to parse SAML metadata");
            ToolkitError::MetadataUnavailable(format!("Failed to parse metadata: {e}"))
        })?;

    let entity_id = entity_descriptor
        .entity_id
        .clone()
        .ok_or_else(|| ToolkitError::MetadataUnavailable("Metadata missing entityID".into()))?;
    if entity_id != source.expected_entity_id {
        return Err(ToolkitError::MetadataUnavailable(format!(
            "Metadata asserts entity id {entity_id}, expected {}",
            source.expected_entity_id
        )));
    }

    if let Some(valid_until) = entity_descriptor.valid_until
        && valid_until <= now
    {
        return Err(ToolkitError::MetadataUnavailable(format!(
            "Metadata for {entity_id} expired at {valid_until}"
        )));
    }

    let mut signing_certificates = Vec::new();
    let mut encryption_certificates = Vec::new();
    for descriptor in entity_descriptor.idp_sso_descriptors.iter().flatten() {
        for kd in &descriptor.key_descriptors {
            let Some(x509_data) = &kd.key_info.x509_data else {
                continue;
            };
            for cert in &x509_data.certificates {
                let certificate = parse_certificate(cert)?;
                // A key descriptor without `use` serves both purposes
                match kd.key_use.as_deref() {
                    Some("signing") => signing_certificates.push(certificate),
                    Some("encryption") => encryption_certificates.push(certificate),
                    _ => {
                        signing_certificates.push(certificate.clone());
                        encryption_certificates.push(certificate);
                    }
                }
            }
        }
    }

    if source.signature_validation == SignatureValidation::Validated {
        verify_certificate_chains(
            signing_certificates
                .iter()
                .chain(encryption_certificates.iter()),
            &source.trust_certificates,
        )?;
    }

    Ok(MetadataSnapshot {
        entity_id,
        valid_until: entity_descriptor.valid_until,
        signing_certificates,
        encryption_certificates,
        fetched_at: now,
    })
}

fn parse_certificate(base64_der: &str) -> Result<X509, ToolkitError> {
    let compact: String = base64_der.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD.decode(compact).map_err(|e| {
        ToolkitError::MetadataUnavailable(format!("Metadata certificate is not base64: {e}"))
    })?;
    X509::from_der(&der).map_err(|e| {
        ToolkitError::MetadataUnavailable(format!("Metadata certificate is invalid: {e}"))
    })
}

/// Require every certificate to chain to one of the configured trust roots.
fn verify_certificate_chains<'a>(
    certificates: impl Iterator<Item = &'a X509>,
    trust_certificates: &[String],
) -> Result<(), ToolkitError> {
    let store_error =
        |e: openssl::error::ErrorStack| ToolkitError::MetadataUnavailable(format!("Trust store error: {e}"));

    let mut builder = X509StoreBuilder::new().map_err(store_error)?;
    for pem in trust_certificates {
        let root = X509::from_pem(pem.as_bytes()).map_err(store_error)?;
        builder.add_cert(root).map_err(store_error)?;
    }
    let store = builder.build();

    for certificate in certificates {
        let chain = Stack::new().map_err(store_error)?;
        let mut context = X509StoreContext::new().map_err(store_error)?;
        let trusted = context
            .init(&store, certificate, &chain, |c| c.verify_cert())
            .map_err(store_error)?;
        if !trusted {
            return Err(ToolkitError::MetadataUnavailable(format!(
                "Metadata certificate {:?} does not chain to a trusted certificate",
                certificate.subject_name()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::tests::fixtures;

    fn hub_source(uri: String) -> MetadataSourceConfig {
        fixtures::metadata_source(&uri, fixtures::HUB_ENTITY_ID)
    }

    fn hub_metadata(valid_until: Option<DateTime<Utc>>) -> String {
        fixtures::metadata_xml(
            fixtures::HUB_ENTITY_ID,
            &fixtures::certificate(0),
            &fixtures::certificate(1),
            valid_until,
        )
    }

    #[test]
    fn test_parse_metadata_splits_key_usages() {
        let source = hub_source("https://hub.example/metadata".to_string());
        let snapshot = parse_metadata(&hub_metadata(None), &source, Utc::now()).unwrap();

        assert_eq!(snapshot.entity_id, fixtures::HUB_ENTITY_ID);
        assert_eq!(snapshot.signing_certificates.len(), 1);
        assert_eq!(snapshot.encryption_certificates.len(), 1);
        let encryption_key = snapshot.encryption_certificates[0].public_key().unwrap();
        assert!(encryption_key.public_eq(fixtures::key_pair(1).public_key()));
    }

    #[test]
    fn test_parse_metadata_rejects_unexpected_entity() {
        let source = fixtures::metadata_source("https://hub.example/metadata", "https://other.example");
        let err = parse_metadata(&hub_metadata(None), &source, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("expected https://other.example"));
    }

    #[test]
    fn test_parse_metadata_rejects_expired_document() {
        let source = hub_source("https://hub.example/metadata".to_string());
        let expired = Utc::now() - ChronoDuration::hours(1);
        let err = parse_metadata(&hub_metadata(Some(expired)), &source, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_parse_metadata_rejects_malformed_document() {
        let source = hub_source("https://hub.example/metadata".to_string());
        let err = parse_metadata("<not-metadata", &source, Utc::now()).unwrap_err();
        assert!(matches!(err, ToolkitError::MetadataUnavailable(_)));
    }

    #[test]
    fn test_validated_metadata_requires_trusted_chain() {
        let mut source = hub_source("https://hub.example/metadata".to_string());
        source.signature_validation = SignatureValidation::Validated;

        source.trust_certificates = vec![fixtures::certificate_pem(2)];
        let err = parse_metadata(&hub_metadata(None), &source, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("does not chain"));

        source.trust_certificates = vec![fixtures::certificate_pem(0), fixtures::certificate_pem(1)];
        assert!(parse_metadata(&hub_metadata(None), &source, Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn test_http_loader_fetches_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/SAML2/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_string(hub_metadata(None)))
            .expect(1)
            .mount(&server)
            .await;

        let loader = HttpMetadataLoader::new();
        let snapshot = loader
            .resolve_metadata(&hub_source(format!("{}/SAML2/metadata", server.uri())))
            .await
            .unwrap();
        assert_eq!(snapshot.entity_id, fixtures::HUB_ENTITY_ID);
    }

    #[tokio::test]
    async fn test_http_loader_reports_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/SAML2/metadata"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let loader = HttpMetadataLoader::new();
        let err = loader
            .resolve_metadata(&hub_source(format!("{}/SAML2/metadata", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolkitError::MetadataUnavailable(_)));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_fetch_with_timeout_bounds_slow_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(hub_metadata(None))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let mut source = hub_source(format!("{}/SAML2/metadata", server.uri()));
        source.timeout_secs = 1;

        let loader = HttpMetadataLoader::new();
        let err = fetch_with_timeout(&loader, &source).await.unwrap_err();
        assert!(matches!(err, ToolkitError::MetadataUnavailable(_)));
    }

    /// Fails on the second call only.
    struct FlakyLoader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataLoader for FlakyLoader {
        async fn resolve_metadata(
            &self,
            source: &MetadataSourceConfig,
        ) -> Result<MetadataSnapshot, ToolkitError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) != 1 {
                Ok(fixtures::snapshot(
                    &source.expected_entity_id,
                    &fixtures::key_pair(0),
                    &fixtures::key_pair(1),
                ))
            } else {
                Err(ToolkitError::MetadataUnavailable("connection refused".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let source = hub_source("https://hub.example/metadata".to_string());
        let loader = Arc::new(FlakyLoader {
            calls: AtomicUsize::new(0),
        });
        let initial = fetch_with_timeout(loader.as_ref(), &source).await.unwrap();
        let resolver = MetadataResolver::new(source, loader, initial);
        let before = resolver.snapshot();

        assert!(resolver.refresh().await.is_err());

        assert!(Arc::ptr_eq(&before, &resolver.snapshot()));
        let health = resolver.health(Utc::now());
        assert!(!health.healthy);
        assert!(health.detail.contains("last refresh failed: Metadata unavailable: connection refused"));
    }

    #[tokio::test]
    async fn test_health_recovers_after_successful_refresh() {
        let source = hub_source("https://hub.example/metadata".to_string());
        let loader = Arc::new(FlakyLoader {
            calls: AtomicUsize::new(0),
        });
        let initial = fetch_with_timeout(loader.as_ref(), &source).await.unwrap();
        let resolver = MetadataResolver::new(source, loader, initial);
        assert!(resolver.health(Utc::now()).healthy);

        assert!(resolver.refresh().await.is_err());
        assert!(!resolver.health(Utc::now()).healthy);

        resolver.refresh().await.unwrap();
        let health = resolver.health(Utc::now());
        assert!(health.healthy, "{}", health.detail);
        assert!(!health.detail.contains("last refresh failed"));
    }

    #[test]
    fn test_health_reports_expired_snapshot() {
        let key_pair = fixtures::key_pair(0);
        let resolver = fixtures::resolver(fixtures::HUB_ENTITY_ID, &key_pair, &key_pair);
        assert!(resolver.health(Utc::now()).healthy);

        let mut snapshot = (*resolver.snapshot()).clone();
        snapshot.valid_until = Some(Utc::now() - ChronoDuration::minutes(1));
        let expired = MetadataResolver::new(
            resolver.source().clone(),
            Arc::new(fixtures::StaticLoader::new(snapshot.clone())),
            snapshot,
        );
        let health = expired.health(Utc::now());
        assert!(!health.healthy);
        assert!(health.detail.contains("expired"));
    }

    #[test]
    fn test_health_reports_entity_mismatch() {
        let key_pair = fixtures::key_pair(0);
        let snapshot = fixtures::snapshot("https://impostor.example", &key_pair, &key_pair);
        let resolver = MetadataResolver::new(
            fixtures::metadata_source("https://hub.example/metadata", fixtures::HUB_ENTITY_ID),
            Arc::new(fixtures::StaticLoader::new(snapshot.clone())),
            snapshot,
        );

        let health = resolver.health(Utc::now());
        assert!(!health.healthy);
        assert!(health.detail.contains("https://impostor.example"));
    }
}
