//! Model selection - scoring and ranking candidate backends.
//!
//! Selection is read-only: it consumes a catalog snapshot and a
//! ledger-derived budget view, so it is safe to call concurrently without
//! locking.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetTracker;
use crate::catalog::{BackendDescriptor, ModelCatalog};
use crate::error::{RouteError, RouteResult};
use crate::ledger::LedgerStore;

/// Blend weights for the candidate score.
const QUALITY_WEIGHT: f64 = 0.4;
const COST_WEIGHT: f64 = 0.3;
const SPEED_WEIGHT: f64 = 0.2;
const HISTORY_WEIGHT: f64 = 0.1;

/// Additive boost applied to an explicitly prioritized dimension.
const PRIORITY_BOOST: f64 = 0.15;

/// Output tokens assumed for cost estimation, capped at 500.
const OUTPUT_ESTIMATE_CAP: u64 = 500;

/// Dimension the caller wants favored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Cost,
    Speed,
    Quality,
}

/// Caller constraints on selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRequirements {
    /// Hard ceiling on the estimated request cost in USD.
    pub max_cost_usd: Option<f64>,
    /// Capabilities every candidate must carry.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Dimension to boost.
    pub priority: Option<Priority>,
    /// Backends to skip, e.g. ones that just failed.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Transient decision record authorizing one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSelection {
    pub backend_id: String,
    pub provider: String,
    pub estimated_cost_usd: f64,
    pub estimated_latency_ms: u64,
    pub quality_score: f64,
    pub max_tokens: u64,
    pub cost_per_token: f64,
}

/// Estimated request cost: ~4 chars per input token plus a capped output
/// allowance of 10% of the backend's max tokens.
pub fn estimate_cost(query: &str, backend: &BackendDescriptor) -> f64 {
    let input_tokens = (query.len() as u64).div_ceil(4);
    let output_tokens = OUTPUT_ESTIMATE_CAP.min(backend.max_tokens / 10);
    (input_tokens + output_tokens) as f64 * backend.cost_per_token
}

/// Scores and ranks candidate backends.
pub struct ModelSelector {
    catalog: Arc<dyn ModelCatalog>,
    ledger: Arc<dyn LedgerStore>,
    budget: Arc<BudgetTracker>,
    fallback_backend: String,
}

impl ModelSelector {
    pub fn new(
        catalog: Arc<dyn ModelCatalog>,
        ledger: Arc<dyn LedgerStore>,
        budget: Arc<BudgetTracker>,
        fallback_backend: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            budget,
            fallback_backend: fallback_backend.into(),
        }
    }

    /// Pick the best backend for this query under current budget and caller
    /// constraints. Deterministic: identical inputs yield identical choices.
    pub async fn select_optimal_model(
        &self,
        query: &str,
        caller_id: Option<&str>,
        requirements: &SelectionRequirements,
    ) -> RouteResult<ModelSelection> {
        let budget = self
            .budget
            .status(caller_id)
            .await
            .map_err(|e| RouteError::Ledger(e.to_string()))?;
        let models = self
            .catalog
            .available_models()
            .await
            .map_err(|e| RouteError::Ledger(e.to_string()))?;

        let candidates: Vec<&BackendDescriptor> = models
            .iter()
            .filter(|m| m.available)
            .filter(|m| !requirements.exclude.contains(&m.id))
            .filter(|m| m.has_capabilities(&requirements.required_capabilities))
            .filter(|m| {
                let cost = estimate_cost(query, m);
                cost <= budget.remaining_budget
                    && requirements.max_cost_usd.map_or(true, |max| cost <= max)
            })
            .collect();

        if candidates.is_empty() {
            // Last resort before the fallback responder: the configured
            // fallback backend, even if nominally over budget.
            if let Some(fallback) = models
                .iter()
                .find(|m| m.id == self.fallback_backend && !requirements.exclude.contains(&m.id))
            {
                tracing::warn!(
                    backend = %fallback.id,
                    "no candidate survived filtering, using configured fallback backend"
                );
                return Ok(self.selection_for(query, fallback));
            }
            if budget.remaining_budget <= 0.0 {
                return Err(RouteError::BudgetExhausted {
                    spent: budget.current_spend,
                    limit: budget.monthly_limit,
                });
            }
            return Err(RouteError::AllBackendsUnavailable);
        }

        // Efficiency terms are relative to the candidate set.
        let max_cost = candidates
            .iter()
            .map(|m| estimate_cost(query, m))
            .fold(f64::MIN, f64::max)
            .max(f64::MIN_POSITIVE);
        let max_latency = candidates
            .iter()
            .map(|m| m.avg_latency_ms)
            .max()
            .unwrap_or(1)
            .max(1) as f64;

        // When the budget is cost-conscious, bias selection the same way an
        // explicit cost priority would.
        let priority = if budget.cost_conscious {
            Some(Priority::Cost)
        } else {
            requirements.priority
        };

        let mut best: Option<(&BackendDescriptor, f64)> = None;
        for candidate in &candidates {
            let history = self
                .ledger
                .success_rate(&candidate.id)
                .await
                .map_err(|e| RouteError::Ledger(e.to_string()))?
                .unwrap_or(0.5);

            let cost_efficiency = 1.0 - estimate_cost(query, candidate) / max_cost;
            let speed_efficiency = 1.0 - candidate.avg_latency_ms as f64 / max_latency;

            let mut score = QUALITY_WEIGHT * candidate.quality_score
                + COST_WEIGHT * cost_efficiency
                + SPEED_WEIGHT * speed_efficiency
                + HISTORY_WEIGHT * history;

            score += match priority {
                Some(Priority::Cost) => PRIORITY_BOOST * cost_efficiency,
                Some(Priority::Speed) => PRIORITY_BOOST * speed_efficiency,
                Some(Priority::Quality) => PRIORITY_BOOST * candidate.quality_score,
                None => 0.0,
            };

            tracing::debug!(backend = %candidate.id, score, "scored candidate");

            // Strictly-greater comparison keeps the first maximum, making
            // ties deterministic in catalog order.
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((candidate, score)),
            }
        }

        let Some((chosen, score)) = best else {
            return Err(RouteError::AllBackendsUnavailable);
        };
        tracing::debug!(backend = %chosen.id, score, "selected backend");
        Ok(self.selection_for(query, chosen))
    }

    fn selection_for(&self, query: &str, backend: &BackendDescriptor) -> ModelSelection {
        ModelSelection {
            backend_id: backend.id.clone(),
            provider: backend.provider.clone(),
            estimated_cost_usd: estimate_cost(query, backend),
            estimated_latency_ms: backend.avg_latency_ms,
            quality_score: backend.quality_score,
            max_tokens: backend.max_tokens,
            cost_per_token: backend.cost_per_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::catalog::StaticCatalog;
    use crate::ledger::SqliteLedger;

    fn descriptor(
        id: &str,
        quality: f64,
        cost_per_token: f64,
        latency: u64,
        capabilities: &[&str],
    ) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            provider: "test".to_string(),
            cost_per_token,
            max_tokens: 4096,
            avg_latency_ms: latency,
            quality_score: quality,
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            available: true,
        }
    }

    fn selector(models: Vec<BackendDescriptor>, limit: f64) -> ModelSelector {
        let catalog = Arc::new(StaticCatalog::new(models));
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let budget = Arc::new(BudgetTracker::new(
            BudgetConfig {
                monthly_limit_usd: limit,
                warning_threshold: 0.8,
                default_backend: "a".to_string(),
            },
            ledger.clone(),
            catalog.clone(),
        ));
        ModelSelector::new(catalog, ledger, budget, "fallback")
    }

    // A is the premium candidate, B the cheap one. With these numbers the
    // blended score favors B unless quality is explicitly prioritized.
    fn ab_models() -> Vec<BackendDescriptor> {
        vec![
            descriptor("a", 0.95, 0.00002, 100, &["chat"]),
            descriptor("b", 0.4, 0.000001, 100, &["chat"]),
        ]
    }

    #[tokio::test]
    async fn selection_is_deterministic() {
        let selector = selector(ab_models(), 100.0);
        let first = selector
            .select_optimal_model("hello world", None, &SelectionRequirements::default())
            .await
            .unwrap();
        for _ in 0..5 {
            let again = selector
                .select_optimal_model("hello world", None, &SelectionRequirements::default())
                .await
                .unwrap();
            assert_eq!(again.backend_id, first.backend_id);
        }
    }

    #[tokio::test]
    async fn quality_priority_prefers_premium() {
        let selector = selector(ab_models(), 100.0);
        let selection = selector
            .select_optimal_model(
                "hello",
                None,
                &SelectionRequirements {
                    priority: Some(Priority::Quality),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(selection.backend_id, "a");
    }

    #[tokio::test]
    async fn cost_priority_prefers_cheap() {
        let selector = selector(ab_models(), 100.0);
        let selection = selector
            .select_optimal_model(
                "hello",
                None,
                &SelectionRequirements {
                    priority: Some(Priority::Cost),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(selection.backend_id, "b");
    }

    #[tokio::test]
    async fn capability_filter_excludes_mismatches() {
        let mut models = ab_models();
        models[0].capabilities.push("vision".to_string());
        let selector = selector(models, 100.0);

        let selection = selector
            .select_optimal_model(
                "describe this image",
                None,
                &SelectionRequirements {
                    required_capabilities: vec!["vision".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(selection.backend_id, "a");
    }

    #[tokio::test]
    async fn exclusion_reroutes_to_next_candidate() {
        let selector = selector(ab_models(), 100.0);
        let selection = selector
            .select_optimal_model(
                "hello",
                None,
                &SelectionRequirements {
                    priority: Some(Priority::Quality),
                    exclude: vec!["a".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(selection.backend_id, "b");
    }

    #[tokio::test]
    async fn empty_survivors_use_fallback_backend() {
        let mut models = ab_models();
        models.push(descriptor("fallback", 0.4, 0.00002, 200, &["chat"]));
        // Zero budget filters out every regular candidate.
        let selector = selector(models, 0.0);

        let selection = selector
            .select_optimal_model("hello", None, &SelectionRequirements::default())
            .await
            .unwrap();
        assert_eq!(selection.backend_id, "fallback");
    }

    #[tokio::test]
    async fn exhausted_budget_without_fallback_is_budget_error() {
        let selector = selector(ab_models(), 0.0);
        let result = selector
            .select_optimal_model("hello", None, &SelectionRequirements::default())
            .await;
        assert!(matches!(result, Err(RouteError::BudgetExhausted { .. })));
    }

    #[tokio::test]
    async fn unsatisfiable_capabilities_are_all_unavailable() {
        let selector = selector(ab_models(), 100.0);
        let result = selector
            .select_optimal_model(
                "hello",
                None,
                &SelectionRequirements {
                    required_capabilities: vec!["vision".to_string()],
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RouteError::AllBackendsUnavailable)));
    }

    #[test]
    fn cost_estimate_shape() {
        let backend = descriptor("a", 0.9, 0.001, 100, &[]);
        // 8 chars -> 2 input tokens; output min(500, 409) = 409.
        let cost = estimate_cost("12345678", &backend);
        assert!((cost - 411.0 * 0.001).abs() < 1e-9);
    }
}
