//! Process-wide dependencies, built once at startup.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;

use super::ids::IdGenerator;

/// Shared dependencies handed to the manager, the transport and the listener.
#[derive(Debug, Clone)]
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<GatewayMetrics>,
    pub ids: Arc<IdGenerator>,
}

impl GatewayContext {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_metrics(config, Arc::new(GatewayMetrics::new()))
    }

    #[must_use]
    pub fn with_metrics(config: GatewayConfig, metrics: Arc<GatewayMetrics>) -> Self {
        let ids = Arc::new(IdGenerator::new(config.cluster_id));
        Self {
            config: Arc::new(config),
            metrics,
            ids,
        }
    }
}
