//! Lazily initialised, shared handles to remote metadata.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    config::MetadataSourceConfig,
    toolkit::{MetadataLoader, MetadataResolver, ToolkitError, fetch_with_timeout},
};

pub const HUB_METADATA: &str = "hubMetadata";
pub const MSA_METADATA: &str = "msaMetadata";

type ResolverAttempt = Shared<BoxFuture<'static, Result<Arc<MetadataResolver>, ToolkitError>>>;

/// Health of one trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorHealth {
    pub name: &'static str,
    pub healthy: bool,
    pub detail: String,
}

/// One remote party's metadata, constructed on first use.
///
/// The first caller starts fetching and validating the metadata; concurrent
/// callers join that attempt and all receive the same resolver. Once an
/// attempt succeeds the resolver is settled for the anchor's lifetime and is
/// read without locking. A failed attempt is not cached: the next call starts
/// a new one.
pub struct TrustAnchor {
    name: &'static str,
    source: MetadataSourceConfig,
    loader: Arc<dyn MetadataLoader>,
    settled: OnceLock<Arc<MetadataResolver>>,
    in_flight: Mutex<Option<ResolverAttempt>>,
}

impl TrustAnchor {
    pub fn new(
        name: &'static str,
        source: MetadataSourceConfig,
        loader: Arc<dyn MetadataLoader>,
    ) -> Self {
        Self {
            name,
            source,
            loader,
            settled: OnceLock::new(),
            in_flight: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &MetadataSourceConfig {
        &self.source
    }

    pub fn is_settled(&self) -> bool {
        self.settled.get().is_some()
    }

    /// The shared resolver, constructing it if no attempt has succeeded yet.
    pub async fn resolver(&self) -> Result<Arc<MetadataResolver>, ToolkitError> {
        if let Some(resolver) = self.settled.get() {
            return Ok(resolver.clone());
        }

        let attempt = {
            let mut slot = self.in_flight.lock();
            if let Some(resolver) = self.settled.get() {
                return Ok(resolver.clone());
            }
            match slot.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let attempt = construct(self.name, self.source.clone(), self.loader.clone())
                        .boxed()
                        .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;

        if let Ok(resolver) = &result
            && self.settled.set(resolver.clone()).is_ok()
        {
            resolver.spawn_refresh();
        }

        let mut slot = self.in_flight.lock();
        if slot
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&attempt))
        {
            *slot = None;
        }

        result
    }

    /// Evaluate the anchor's health.
    ///
    /// An anchor that has not settled attempts construction first; a settled
    /// anchor only inspects its current snapshot.
    pub async fn check_health(&self) -> AnchorHealth {
        match self.resolver().await {
            Ok(resolver) => {
                let health = resolver.health(Utc::now());
                AnchorHealth {
                    name: self.name,
                    healthy: health.healthy,
                    detail: health.detail,
                }
            }
            Err(e) => AnchorHealth {
                name: self.name,
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}

impl std::fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("name", &self.name)
            .field("uri", &self.source.uri)
            .field("expected_entity_id", &self.source.expected_entity_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

async fn construct(
    name: &'static str,
    source: MetadataSourceConfig,
    loader: Arc<dyn MetadataLoader>,
) -> Result<Arc<MetadataResolver>, ToolkitError> {
    tracing::info!(anchor = name, uri = %source.uri, "Initializing trust anchor");

    match fetch_with_timeout(loader.as_ref(), &source).await {
        Ok(snapshot) => {
            tracing::info!(
                anchor = name,
                entity_id = %snapshot.entity_id,
                signing_keys = snapshot.signing_certificates.len(),
                encryption_keys = snapshot.encryption_certificates.len(),
                "Trust anchor initialized"
            );
            Ok(Arc::new(MetadataResolver::new(source, loader, snapshot)))
        }
        Err(e) => {
            tracing::warn!(anchor = name, error = %e, "Trust anchor initialization failed");
            Err(e)
        }
    }
}
