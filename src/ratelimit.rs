//! Admission control: per-caller request quotas.
//!
//! Two nested windows per caller (or a global bucket when no caller id is
//! given): a sliding one-minute window over in-memory timestamps, and a
//! monthly request ceiling answered by the usage ledger. A denial must
//! short-circuit the router before the circuit breaker or any backend call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ledger::{month_start, LedgerStore};

const SHORT_WINDOW: Duration = Duration::from_secs(60);

/// Bucket key for callers without an id.
const GLOBAL_BUCKET: &str = "__global__";

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the one-minute window after this check.
    pub remaining_requests: u32,
    /// Time until the oldest windowed request expires.
    pub reset_after: Duration,
    /// Requests left in the monthly quota.
    pub remaining_monthly: u64,
}

/// Rate limiter tunables.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub monthly_request_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            monthly_request_limit: 10_000,
        }
    }
}

/// Per-caller sliding-window limiter backed by the ledger for the long window.
pub struct RateLimiter {
    config: RateLimitConfig,
    ledger: Arc<dyn LedgerStore>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            config,
            ledger,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check admission for a caller. Does not consume quota; call
    /// [`track_usage`](Self::track_usage) after the attempt completes.
    pub async fn check(&self, caller_id: Option<&str>) -> anyhow::Result<RateLimitDecision> {
        let bucket = caller_id.unwrap_or(GLOBAL_BUCKET);

        // Ledger read happens before taking the window lock; no lock is held
        // across I/O.
        let monthly_used = self
            .ledger
            .count_since(caller_id, month_start(Utc::now()))
            .await?;
        let remaining_monthly = self
            .config
            .monthly_request_limit
            .saturating_sub(monthly_used);

        let mut windows = self.windows.lock().await;
        // Sweep every bucket so quiet callers do not accumulate forever.
        windows.retain(|_, window| {
            Self::prune(window);
            !window.is_empty()
        });

        let window = windows.get(bucket);
        let used = window.map_or(0, VecDeque::len) as u32;
        let remaining_requests = self.config.requests_per_minute.saturating_sub(used);
        let reset_after = window
            .and_then(VecDeque::front)
            .map(|first| SHORT_WINDOW.saturating_sub(first.elapsed()))
            .unwrap_or(Duration::ZERO);

        let allowed = remaining_requests > 0 && remaining_monthly > 0;
        if !allowed {
            tracing::warn!(
                caller = bucket,
                remaining_requests,
                remaining_monthly,
                "request denied by rate limiter"
            );
        }

        Ok(RateLimitDecision {
            allowed,
            // The admitted request consumes one slot.
            remaining_requests: if allowed {
                remaining_requests - 1
            } else {
                remaining_requests
            },
            reset_after,
            remaining_monthly: if allowed {
                remaining_monthly - 1
            } else {
                remaining_monthly
            },
        })
    }

    /// Record one attempt against the caller's short window. Called after
    /// every attempt regardless of outcome; the monthly window is fed by the
    /// ledger records the router writes.
    pub async fn track_usage(&self, caller_id: Option<&str>) {
        let bucket = caller_id.unwrap_or(GLOBAL_BUCKET);
        let mut windows = self.windows.lock().await;
        let window = windows.entry(bucket.to_string()).or_default();
        Self::prune(window);
        window.push_back(Instant::now());
    }

    #[cfg(test)]
    async fn tracked_callers(&self) -> usize {
        self.windows.lock().await.len()
    }

    fn prune(window: &mut VecDeque<Instant>) {
        while window
            .front()
            .map(|t| t.elapsed() >= SHORT_WINDOW)
            .unwrap_or(false)
        {
            window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SqliteLedger;

    fn limiter(rpm: u32, monthly: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig {
                requests_per_minute: rpm,
                monthly_request_limit: monthly,
            },
            Arc::new(SqliteLedger::in_memory().unwrap()),
        )
    }

    #[tokio::test]
    async fn admits_exactly_the_window_limit() {
        let limiter = limiter(3, 1000);

        for _ in 0..3 {
            let decision = limiter.check(Some("alice")).await.unwrap();
            assert!(decision.allowed);
            limiter.track_usage(Some("alice")).await;
        }

        let denied = limiter.check(Some("alice")).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_requests, 0);
        assert!(denied.reset_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn callers_have_independent_windows() {
        let limiter = limiter(1, 1000);

        limiter.track_usage(Some("alice")).await;
        assert!(!limiter.check(Some("alice")).await.unwrap().allowed);
        assert!(limiter.check(Some("bob")).await.unwrap().allowed);
        assert!(limiter.check(None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn monthly_ceiling_denies_via_ledger() {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let limiter = RateLimiter::new(
            RateLimitConfig {
                requests_per_minute: 100,
                monthly_request_limit: 2,
            },
            ledger.clone(),
        );

        use crate::ledger::{LedgerStore as _, UsageRecord};
        ledger
            .save(&UsageRecord::success("m", Some("alice".into()), 1, 1, 0.0))
            .await
            .unwrap();
        ledger
            .save(&UsageRecord::failure("m", Some("alice".into())))
            .await
            .unwrap();

        let decision = limiter.check(Some("alice")).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining_monthly, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_callers_are_evicted_from_the_window_map() {
        let limiter = limiter(5, 1000);
        limiter.track_usage(Some("alice")).await;
        limiter.track_usage(Some("bob")).await;
        assert_eq!(limiter.tracked_callers().await, 2);

        // Once their windows empty, both buckets are swept on the next check.
        tokio::time::advance(Duration::from_secs(61)).await;
        let decision = limiter.check(Some("alice")).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_requests, 4);
        assert_eq!(limiter.tracked_callers().await, 0);
    }

    #[tokio::test]
    async fn decision_reports_decremented_remaining() {
        let limiter = limiter(5, 1000);
        let decision = limiter.check(Some("alice")).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_requests, 4);
    }
}
