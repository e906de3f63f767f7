//! Request router - orchestrates selection, admission, circuit-protected
//! calls, retry/backoff, usage recording and fallback hand-off.
//!
//! Flow per request: select → admission check → up to `retry_attempts`
//! circuit-protected calls with exponential backoff → usage record per
//! attempt → on hard failure, one cheap/fast reroute excluding the failed
//! backend → degraded similarity fallback as the last resort.
//!
//! Retries are sequential per request; independent requests proceed
//! concurrently. No lock is held across a backend call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend::BackendRegistry;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::catalog::ModelCatalog;
use crate::config::GatewayConfig;
use crate::error::{RouteError, RouteResult};
use crate::fallback::{CallerProfile, FallbackCandidate, FallbackResponder, FallbackResult};
use crate::ledger::{LedgerStore, UsageRecord};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::selector::{ModelSelection, ModelSelector, Priority, SelectionRequirements};

/// Caller preferences accepted by [`RequestRouter::generate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratePreferences {
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub priority: Option<Priority>,
    /// Attribute embeddings used if the request degrades to the similarity
    /// fallback.
    #[serde(default)]
    pub fallback_profile: CallerProfile,
}

/// Answer returned to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    /// Selection confidence for model answers, normalized fallback score for
    /// degraded ones.
    pub confidence: f64,
    /// Backend id, or the fallback method name for degraded answers.
    pub model_used: String,
    pub cost_usd: f64,
    pub degraded: bool,
}

/// The routing core. One instance serves concurrent requests.
pub struct RequestRouter {
    config: GatewayConfig,
    selector: Arc<ModelSelector>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    backends: BackendRegistry,
    catalog: Arc<dyn ModelCatalog>,
    ledger: Arc<dyn LedgerStore>,
    responder: FallbackResponder,
    /// Read-only local pool the fallback responder ranks.
    fallback_pool: Vec<FallbackCandidate>,
}

impl RequestRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GatewayConfig,
        selector: Arc<ModelSelector>,
        backends: BackendRegistry,
        catalog: Arc<dyn ModelCatalog>,
        ledger: Arc<dyn LedgerStore>,
        fallback_pool: Vec<FallbackCandidate>,
    ) -> Self {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                requests_per_minute: config.requests_per_minute,
                monthly_request_limit: config.monthly_request_limit,
            },
            ledger.clone(),
        );
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
            half_open_max_calls: config.half_open_max_calls,
        });
        Self {
            config,
            selector,
            limiter,
            breaker,
            backends,
            catalog,
            ledger,
            responder: FallbackResponder::new(),
            fallback_pool,
        }
    }

    /// Outbound surface: answer a query, degrading instead of failing
    /// wherever possible. The only errors surfaced are `RateLimited`,
    /// `BudgetExhausted` and `AllBackendsUnavailable`.
    pub async fn generate(
        &self,
        query: &str,
        caller_id: Option<&str>,
        preferences: &GeneratePreferences,
    ) -> RouteResult<GenerateResponse> {
        let requirements = SelectionRequirements {
            max_cost_usd: preferences.max_cost_usd,
            required_capabilities: preferences.required_capabilities.clone(),
            priority: preferences.priority,
            exclude: Vec::new(),
        };

        let selection = match self
            .selector
            .select_optimal_model(query, caller_id, &requirements)
            .await
        {
            Ok(selection) => selection,
            Err(err) => {
                tracing::warn!(error = %err, "selection failed, degrading to fallback");
                return self.degrade(preferences, err);
            }
        };

        match self.route_request(query, &selection, caller_id).await {
            Ok(response) => Ok(response),
            // Admission denials are surfaced, not degraded: the caller must
            // back off.
            Err(err @ RouteError::RateLimited { .. }) => Err(err),
            Err(err) => {
                self.handle_model_failure(query, &selection, caller_id, preferences, err)
                    .await
            }
        }
    }

    /// Attempt the selected backend with bounded retries through the circuit
    /// breaker. Writes one usage record per attempt.
    pub async fn route_request(
        &self,
        query: &str,
        selection: &ModelSelection,
        caller_id: Option<&str>,
    ) -> RouteResult<GenerateResponse> {
        let decision = self
            .limiter
            .check(caller_id)
            .await
            .map_err(|e| RouteError::Ledger(e.to_string()))?;
        if !decision.allowed {
            return Err(RouteError::RateLimited {
                remaining_requests: decision.remaining_requests,
                reset_after: decision.reset_after,
                remaining_monthly: decision.remaining_monthly,
            });
        }

        let backend_id = selection.backend_id.clone();
        let client =
            self.backends
                .get(&backend_id)
                .ok_or_else(|| RouteError::BackendCallFailed {
                    backend: backend_id.clone(),
                    reason: "no client registered for backend".to_string(),
                })?;

        let mut last_error: Option<RouteError> = None;

        for attempt in 1..=self.config.retry_attempts {
            let started = Instant::now();
            let call_client = client.clone();
            let call_backend = backend_id.clone();
            let call_prompt = query.to_string();
            let call_timeout = self.config.call_timeout;
            let max_tokens = selection.max_tokens;
            let result = self
                .breaker
                .call(&backend_id, move || async move {
                    match tokio::time::timeout(
                        call_timeout,
                        call_client.generate(&call_backend, &call_prompt, max_tokens),
                    )
                    .await
                    {
                        Ok(inner) => inner,
                        // A timeout counts as a breaker failure.
                        Err(_) => Err(RouteError::BackendCallFailed {
                            backend: call_backend.clone(),
                            reason: format!("call timed out after {:?}", call_timeout),
                        }),
                    }
                })
                .await;

            self.limiter.track_usage(caller_id).await;

            match result {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let cost = response
                        .reported_cost
                        .unwrap_or(selection.estimated_cost_usd);

                    self.record_attempt(UsageRecord::success(
                        &backend_id,
                        caller_id.map(str::to_string),
                        response.tokens,
                        latency_ms,
                        cost,
                    ))
                    .await;
                    let _ = self
                        .catalog
                        .record_model_usage(&backend_id, latency_ms, cost, response.tokens, true)
                        .await;

                    if attempt > 1 {
                        tracing::info!(backend = %backend_id, attempt, "request succeeded after retries");
                    }

                    return Ok(GenerateResponse {
                        content: response.content,
                        confidence: selection.quality_score,
                        model_used: backend_id,
                        cost_usd: cost,
                        degraded: false,
                    });
                }
                Err(err) => {
                    // Zero-value sample feeds performance history.
                    self.record_attempt(UsageRecord::failure(
                        &backend_id,
                        caller_id.map(str::to_string),
                    ))
                    .await;
                    let _ = self
                        .catalog
                        .record_model_usage(&backend_id, 0, 0.0, 0, false)
                        .await;

                    // An open circuit means this backend is not coming back
                    // within our retry horizon; reroute immediately.
                    if !err.is_retryable() {
                        return Err(err);
                    }

                    if attempt < self.config.retry_attempts {
                        let delay = self.backoff_delay(attempt);
                        tracing::warn!(
                            backend = %backend_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "backend attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(RouteError::AllBackendsUnavailable))
    }

    /// On a hard failure of the chosen backend, re-select biased toward
    /// cheap/fast candidates excluding it, route once more, and degrade to
    /// the fallback responder if that also fails.
    async fn handle_model_failure(
        &self,
        query: &str,
        failed: &ModelSelection,
        caller_id: Option<&str>,
        preferences: &GeneratePreferences,
        original_error: RouteError,
    ) -> RouteResult<GenerateResponse> {
        tracing::warn!(
            backend = %failed.backend_id,
            error = %original_error,
            "backend failed, rerouting to alternate candidate"
        );

        let reroute = SelectionRequirements {
            max_cost_usd: preferences.max_cost_usd,
            required_capabilities: preferences.required_capabilities.clone(),
            // Bias the second pass toward cheap candidates.
            priority: Some(Priority::Cost),
            exclude: vec![failed.backend_id.clone()],
        };

        match self
            .selector
            .select_optimal_model(query, caller_id, &reroute)
            .await
        {
            Ok(alternate) => match self.route_request(query, &alternate, caller_id).await {
                Ok(response) => Ok(response),
                Err(err @ RouteError::RateLimited { .. }) => Err(err),
                Err(err) => self.degrade(preferences, err),
            },
            Err(err) => self.degrade(preferences, err),
        }
    }

    /// Produce the degraded similarity answer. With no pool to rank, the
    /// cause is surfaced: `BudgetExhausted` as-is, anything else as
    /// `AllBackendsUnavailable`.
    fn degrade(
        &self,
        preferences: &GeneratePreferences,
        cause: RouteError,
    ) -> RouteResult<GenerateResponse> {
        let result = self
            .responder
            .respond(&preferences.fallback_profile, &self.fallback_pool);

        if result.recommendations.is_empty() && self.fallback_pool.is_empty() {
            tracing::error!(error = %cause, "fallback pool empty, surfacing hard failure");
            return Err(match cause {
                RouteError::BudgetExhausted { .. } => cause,
                _ => RouteError::AllBackendsUnavailable,
            });
        }

        Ok(Self::degraded_response(result))
    }

    fn degraded_response(result: FallbackResult) -> GenerateResponse {
        let confidence = result
            .recommendations
            .first()
            .map(|r| r.score)
            .unwrap_or(0.0);
        let content = render_fallback(&result);
        GenerateResponse {
            content,
            confidence,
            model_used: result.method,
            cost_usd: 0.0,
            degraded: true,
        }
    }

    /// Exponential backoff: `retry_delay × 2^(attempt−1)` plus up to 10%
    /// jitter to avoid retry alignment across concurrent requests.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay * 2u32.saturating_pow(attempt - 1);
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        base + base.mul_f64(jitter)
    }

    async fn record_attempt(&self, record: UsageRecord) {
        if let Err(e) = self.ledger.save(&record).await {
            // Losing a usage sample must not fail the request itself.
            tracing::error!(error = %e, backend = %record.backend_id, "failed to persist usage record");
        }
    }
}

/// Plain-text rendering of a fallback result.
fn render_fallback(result: &FallbackResult) -> String {
    if result.recommendations.is_empty() {
        return format!("[degraded: {}] {}", result.method, result.explanation);
    }
    let lines: Vec<String> = result
        .recommendations
        .iter()
        .map(|r| format!("{}. {} (match {:.0}%)", r.rank, r.label, r.score * 100.0))
        .collect();
    format!(
        "[degraded: {}] {}\n{}",
        result.method,
        result.explanation,
        lines.join("\n")
    )
}
