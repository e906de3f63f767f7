//! Backend catalog - descriptors for the candidate inference backends.
//!
//! The catalog is a collaborator owned by the surrounding platform; the core
//! reads descriptor snapshots per selection round and reports per-call
//! outcomes back. [`StaticCatalog`] is the in-process implementation used by
//! the gateway and by tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Immutable snapshot describing one candidate backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Stable backend id, e.g. `"openai/gpt-4o"`. Used as the circuit breaker
    /// dependency key.
    pub id: String,
    /// Provider name, e.g. `"openai"`.
    pub provider: String,
    /// Cost per token in USD.
    pub cost_per_token: f64,
    /// Maximum tokens per request.
    pub max_tokens: u64,
    /// Average response latency in milliseconds.
    pub avg_latency_ms: u64,
    /// Quality score in [0, 1].
    pub quality_score: f64,
    /// Capability tags, e.g. `"chat"`, `"code"`, `"vision"`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Whether the backend is currently usable.
    pub available: bool,
}

impl BackendDescriptor {
    /// Check that this backend carries every required capability.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|cap| self.capabilities.iter().any(|c| c == cap))
    }
}

/// Catalog of candidate backends, implemented by the surrounding platform.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// All backend descriptors, available or not.
    async fn available_models(&self) -> anyhow::Result<Vec<BackendDescriptor>>;

    /// Report the outcome of one call for the backend's rolling history.
    async fn record_model_usage(
        &self,
        id: &str,
        latency_ms: u64,
        cost_usd: f64,
        tokens: u64,
        success: bool,
    ) -> anyhow::Result<()>;

    /// Flip a backend's availability flag.
    async fn update_availability(&self, id: &str, available: bool) -> anyhow::Result<()>;
}

/// Rolling per-backend usage counters kept by [`StaticCatalog`].
#[derive(Debug, Clone, Default)]
struct UsageHistory {
    calls: u64,
    failures: u64,
    total_latency_ms: u64,
    total_cost_usd: f64,
}

/// In-memory catalog with a fixed descriptor list and mutable availability.
pub struct StaticCatalog {
    models: RwLock<Vec<BackendDescriptor>>,
    history: RwLock<HashMap<String, UsageHistory>>,
}

impl StaticCatalog {
    pub fn new(models: Vec<BackendDescriptor>) -> Self {
        Self {
            models: RwLock::new(models),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Observed failure ratio for a backend, if any calls were recorded.
    pub async fn failure_ratio(&self, id: &str) -> Option<f64> {
        let history = self.history.read().await;
        history
            .get(id)
            .filter(|h| h.calls > 0)
            .map(|h| h.failures as f64 / h.calls as f64)
    }
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    async fn available_models(&self) -> anyhow::Result<Vec<BackendDescriptor>> {
        Ok(self.models.read().await.clone())
    }

    async fn record_model_usage(
        &self,
        id: &str,
        latency_ms: u64,
        cost_usd: f64,
        _tokens: u64,
        success: bool,
    ) -> anyhow::Result<()> {
        let mut history = self.history.write().await;
        let entry = history.entry(id.to_string()).or_default();
        entry.calls += 1;
        if !success {
            entry.failures += 1;
        }
        entry.total_latency_ms += latency_ms;
        entry.total_cost_usd += cost_usd;
        Ok(())
    }

    async fn update_availability(&self, id: &str, available: bool) -> anyhow::Result<()> {
        let mut models = self.models.write().await;
        match models.iter_mut().find(|m| m.id == id) {
            Some(model) => {
                if model.available != available {
                    tracing::info!(backend = id, available, "backend availability changed");
                }
                model.available = available;
                Ok(())
            }
            None => anyhow::bail!("unknown backend id: {}", id),
        }
    }
}

/// Shared catalog handle for concurrent access.
pub type SharedCatalog = Arc<dyn ModelCatalog>;

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            provider: "test".to_string(),
            cost_per_token: 0.00001,
            max_tokens: 4096,
            avg_latency_ms: 300,
            quality_score: 0.8,
            capabilities: vec!["chat".to_string(), "code".to_string()],
            available: true,
        }
    }

    #[test]
    fn capability_check() {
        let d = descriptor("a");
        assert!(d.has_capabilities(&["chat".to_string()]));
        assert!(d.has_capabilities(&[]));
        assert!(!d.has_capabilities(&["vision".to_string()]));
    }

    #[tokio::test]
    async fn availability_update() {
        let catalog = StaticCatalog::new(vec![descriptor("a")]);
        catalog.update_availability("a", false).await.unwrap();
        let models = catalog.available_models().await.unwrap();
        assert!(!models[0].available);

        assert!(catalog.update_availability("missing", false).await.is_err());
    }

    #[tokio::test]
    async fn usage_history_tracks_failures() {
        let catalog = StaticCatalog::new(vec![descriptor("a")]);
        assert_eq!(catalog.failure_ratio("a").await, None);

        catalog.record_model_usage("a", 200, 0.01, 100, true).await.unwrap();
        catalog.record_model_usage("a", 200, 0.0, 0, false).await.unwrap();

        assert_eq!(catalog.failure_ratio("a").await, Some(0.5));
    }
}
