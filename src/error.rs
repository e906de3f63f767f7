//! Error taxonomy for the routing core.
//!
//! Two families:
//! - [`SimilarityError`]: caller bugs in the pure vector math. Never retried,
//!   never swallowed; they abort the single operation that raised them.
//! - [`RouteError`]: everything the router can surface. Each variant carries
//!   enough metadata for the caller to decide between backing off, rerouting
//!   and falling back.

use std::time::Duration;

use thiserror::Error;

/// Errors from the pure similarity math. All of these indicate misuse by the
/// caller rather than a runtime condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimilarityError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("empty embedding input")]
    EmptyInput,

    #[error("scores and weights differ in length: {scores} vs {weights}")]
    LengthMismatch { scores: usize, weights: usize },

    #[error("weights sum to zero")]
    ZeroWeightSum,
}

/// Errors surfaced by the request router and its collaborators.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Admission denied by the rate limiter. Recoverable by backing off until
    /// `reset_after`.
    #[error("rate limited: {remaining_requests} requests left in window, resets in {reset_after:?}")]
    RateLimited {
        remaining_requests: u32,
        reset_after: Duration,
        remaining_monthly: u64,
    },

    /// The circuit for this backend is open; the call was rejected without
    /// being attempted. Signals the router to try another candidate, not to
    /// retry this one.
    #[error("circuit open for backend '{backend}', retry eligible in {retry_after:?}")]
    CircuitOpen {
        backend: String,
        retry_after: Duration,
    },

    /// A backend call failed (network, HTTP error, timeout). Transient:
    /// retried with backoff up to the attempt limit.
    #[error("backend '{backend}' call failed: {reason}")]
    BackendCallFailed { backend: String, reason: String },

    /// The monthly budget for this caller/period is exhausted. Non-retryable
    /// for the period; triggers cheaper-model rerouting or fallback.
    #[error("budget exhausted: spent {spent:.4} of {limit:.4} USD")]
    BudgetExhausted { spent: f64, limit: f64 },

    /// No backend could serve the request and the fallback responder also
    /// failed. This is the only hard failure the caller should ever see.
    #[error("no inference backend available and no fallback could be computed")]
    AllBackendsUnavailable,

    #[error("similarity computation failed: {0}")]
    Similarity(#[from] SimilarityError),

    /// Usage ledger read/write failure.
    #[error("usage ledger error: {0}")]
    Ledger(String),
}

impl RouteError {
    /// Whether the router may retry the same backend after this error.
    ///
    /// `CircuitOpen` is deliberately non-retryable here: the breaker has
    /// already decided the backend is unhealthy, so the router reroutes
    /// instead of burning attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouteError::BackendCallFailed { .. })
    }
}

pub type RouteResult<T> = Result<T, RouteError>;
