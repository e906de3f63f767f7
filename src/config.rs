//! Gateway configuration.
//!
//! Environment variables are used as overrides on top of the built-in
//! defaults, so a bare `GatewayConfig::default()` is always usable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the routing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Monthly spending ceiling in USD.
    pub monthly_budget_usd: f64,
    /// Utilization ratio above which selection biases toward cheap backends.
    pub budget_warning_threshold: f64,
    /// Backend recommended while under the warning threshold.
    pub default_backend: String,
    /// Last-resort backend when no candidate survives filtering.
    pub fallback_backend: String,

    /// Attempts per backend before giving up on it.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_delay: Duration,
    /// Per-call timeout; an elapsed timeout counts as a breaker failure.
    pub call_timeout: Duration,

    /// Short-window admission quota per caller.
    pub requests_per_minute: u32,
    /// Monthly request ceiling per caller, enforced via the ledger.
    pub monthly_request_limit: u64,

    /// Consecutive failures before a circuit opens.
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing probes.
    pub recovery_timeout: Duration,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            monthly_budget_usd: 100.0,
            budget_warning_threshold: 0.8,
            default_backend: "openai/gpt-4o".to_string(),
            fallback_backend: "openai/gpt-4o-mini".to_string(),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
            requests_per_minute: 30,
            monthly_request_limit: 10_000,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

impl GatewayConfig {
    /// Defaults with environment overrides applied:
    /// - `GATEWAY_MONTHLY_BUDGET_USD`
    /// - `GATEWAY_DEFAULT_BACKEND`
    /// - `GATEWAY_FALLBACK_BACKEND`
    /// - `GATEWAY_REQUESTS_PER_MINUTE`
    /// - `GATEWAY_MONTHLY_REQUEST_LIMIT`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(budget) = env_parse::<f64>("GATEWAY_MONTHLY_BUDGET_USD") {
            config.monthly_budget_usd = budget;
        }
        if let Ok(backend) = std::env::var("GATEWAY_DEFAULT_BACKEND") {
            config.default_backend = backend;
        }
        if let Ok(backend) = std::env::var("GATEWAY_FALLBACK_BACKEND") {
            config.fallback_backend = backend;
        }
        if let Some(rpm) = env_parse::<u32>("GATEWAY_REQUESTS_PER_MINUTE") {
            config.requests_per_minute = rpm;
        }
        if let Some(limit) = env_parse::<u64>("GATEWAY_MONTHLY_REQUEST_LIMIT") {
            config.monthly_request_limit = limit;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
