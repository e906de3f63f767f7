//! Budget tracking - derived view over the usage ledger.
//!
//! Nothing here is persisted; every status is recomputed on demand from the
//! ledger's monthly aggregate. Past the warning threshold the recommendation
//! flips from the configured default backend to the cheapest available one,
//! and the selector biases toward low-cost candidates.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ModelCatalog;
use crate::ledger::LedgerStore;

/// Derived budget view for one caller (or the global bucket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub current_spend: f64,
    pub monthly_limit: f64,
    /// Clamped to zero; never negative.
    pub remaining_budget: f64,
    /// spend / limit. Zero when the limit is zero.
    pub utilization: f64,
    /// Backend to prefer given current utilization.
    pub recommended_backend: String,
    /// Whether utilization crossed the warning threshold.
    pub cost_conscious: bool,
    pub days_remaining: u32,
}

/// Budget tracker configuration.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub monthly_limit_usd: f64,
    pub warning_threshold: f64,
    pub default_backend: String,
}

/// Computes [`BudgetStatus`] from the ledger and catalog.
pub struct BudgetTracker {
    config: BudgetConfig,
    ledger: Arc<dyn LedgerStore>,
    catalog: Arc<dyn ModelCatalog>,
}

impl BudgetTracker {
    pub fn new(
        config: BudgetConfig,
        ledger: Arc<dyn LedgerStore>,
        catalog: Arc<dyn ModelCatalog>,
    ) -> Self {
        Self {
            config,
            ledger,
            catalog,
        }
    }

    /// Current budget status for a caller (`None` = all callers).
    pub async fn status(&self, caller_id: Option<&str>) -> anyhow::Result<BudgetStatus> {
        let spend = self.ledger.monthly_spend(caller_id).await?;
        let limit = self.config.monthly_limit_usd;

        let utilization = if limit > 0.0 { spend / limit } else { 0.0 };
        let cost_conscious = utilization >= self.config.warning_threshold;

        let recommended_backend = if cost_conscious {
            match self.cheapest_available().await? {
                Some(id) => {
                    tracing::warn!(
                        utilization = format!("{:.2}", utilization),
                        recommended = %id,
                        "budget warning threshold crossed, recommending cheapest backend"
                    );
                    id
                }
                None => self.config.default_backend.clone(),
            }
        } else {
            self.config.default_backend.clone()
        };

        Ok(BudgetStatus {
            current_spend: spend,
            monthly_limit: limit,
            remaining_budget: (limit - spend).max(0.0),
            utilization,
            recommended_backend,
            cost_conscious,
            days_remaining: days_remaining_in_month(Utc::now()),
        })
    }

    async fn cheapest_available(&self) -> anyhow::Result<Option<String>> {
        let models = self.catalog.available_models().await?;
        Ok(models
            .into_iter()
            .filter(|m| m.available)
            .min_by(|a, b| {
                a.cost_per_token
                    .partial_cmp(&b.cost_per_token)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|m| m.id))
    }
}

/// Days remaining in the calendar month, counting today.
pub fn days_remaining_in_month(now: DateTime<Utc>) -> u32 {
    let days_in_month = match now.month() {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            let year = now.year();
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
    };
    days_in_month - now.day() + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendDescriptor, StaticCatalog};
    use crate::ledger::{LedgerStore as _, SqliteLedger, UsageRecord};
    use chrono::TimeZone;

    fn descriptor(id: &str, cost: f64, available: bool) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            provider: "test".to_string(),
            cost_per_token: cost,
            max_tokens: 4096,
            avg_latency_ms: 100,
            quality_score: 0.5,
            capabilities: vec![],
            available,
        }
    }

    fn tracker(limit: f64, ledger: Arc<SqliteLedger>) -> BudgetTracker {
        let catalog = Arc::new(StaticCatalog::new(vec![
            descriptor("premium", 0.0001, true),
            descriptor("cheap", 0.000001, true),
            descriptor("cheapest-but-down", 0.0000001, false),
        ]));
        BudgetTracker::new(
            BudgetConfig {
                monthly_limit_usd: limit,
                warning_threshold: 0.8,
                default_backend: "premium".to_string(),
            },
            ledger,
            catalog,
        )
    }

    #[tokio::test]
    async fn zero_spend_full_budget() {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let status = tracker(100.0, ledger).status(None).await.unwrap();

        assert_eq!(status.utilization, 0.0);
        assert_eq!(status.remaining_budget, 100.0);
        assert!(!status.cost_conscious);
        assert_eq!(status.recommended_backend, "premium");
    }

    #[tokio::test]
    async fn warning_threshold_recommends_cheapest_available() {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        ledger
            .save(&UsageRecord::success("premium", None, 1000, 100, 80.0))
            .await
            .unwrap();

        let status = tracker(100.0, ledger).status(None).await.unwrap();
        assert!((status.utilization - 0.8).abs() < 1e-9);
        assert!(status.cost_conscious);
        // Unavailable backends are never recommended.
        assert_eq!(status.recommended_backend, "cheap");
    }

    #[tokio::test]
    async fn remaining_budget_clamped_to_zero() {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        ledger
            .save(&UsageRecord::success("premium", None, 1000, 100, 150.0))
            .await
            .unwrap();

        let status = tracker(100.0, ledger).status(None).await.unwrap();
        assert_eq!(status.remaining_budget, 0.0);
        assert!(status.utilization > 1.0);
    }

    #[test]
    fn days_remaining_counts_today() {
        let last_of_feb = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        assert_eq!(days_remaining_in_month(last_of_feb), 1);

        let leap_feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(days_remaining_in_month(leap_feb), 29);

        let mid_august = Utc.with_ymd_and_hms(2026, 8, 25, 0, 0, 0).unwrap();
        assert_eq!(days_remaining_in_month(mid_august), 7);
    }
}
