use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use super::{AnchorHealth, TrustAnchor};

/// Aggregate health across all trust anchors.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub anchors: Vec<AnchorHealth>,
}

/// Probes every trust anchor concurrently.
#[derive(Debug, Clone)]
pub struct TrustAnchorHealthMonitor {
    anchors: Vec<Arc<TrustAnchor>>,
}

impl TrustAnchorHealthMonitor {
    pub fn new(anchors: Vec<Arc<TrustAnchor>>) -> Self {
        Self { anchors }
    }

    pub async fn check(&self) -> HealthReport {
        let anchors = join_all(self.anchors.iter().map(|anchor| anchor.check_health())).await;
        let healthy = anchors.iter().all(|anchor| anchor.healthy);

        for anchor in anchors.iter().filter(|anchor| !anchor.healthy) {
            tracing::warn!(anchor = anchor.name, detail = %anchor.detail, "Trust anchor unhealthy");
        }

        HealthReport { healthy, anchors }
    }
}
