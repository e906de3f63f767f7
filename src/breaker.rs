//! Circuit breaker for backend fault isolation.
//!
//! One state machine per dependency key (backend id), so a failing backend
//! cannot blind the router to healthy ones.
//!
//! # State transitions
//! ```text
//! Closed → Open:      failure count reaches threshold
//! Open → HalfOpen:    recovery timeout elapses
//! HalfOpen → Closed:  a trial call succeeds (failure count resets)
//! HalfOpen → Open:    a trial call fails (recovery timer restarts)
//! ```
//!
//! Any success while Closed resets the failure counter, so only an unbroken
//! run of failures trips the breaker. A call dropped between admission and
//! completion counts as a failure, so cancelled half-open probes cannot
//! strand the circuit. State is process-scoped and in-memory; a fresh
//! process starts every breaker Closed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{RouteError, RouteResult};

/// Breaker state for one dependency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tunables.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub recovery_timeout: Duration,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

/// Per-key bookkeeping. Mutated only under the breaker's mutex.
#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl CircuitEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }
}

/// Keyed circuit breaker wrapping arbitrary async calls.
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, CircuitEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Run `operation` under the circuit for `key`.
    ///
    /// Rejects with [`RouteError::CircuitOpen`] without invoking the
    /// operation when the circuit is open, or when the half-open probe cap is
    /// already saturated. No lock is held while the operation is awaited.
    /// Dropping the returned future after admission counts as a failure, so
    /// a cancelled probe releases its half-open slot instead of wedging the
    /// circuit.
    pub async fn call<F, Fut, T>(&self, key: &str, operation: F) -> RouteResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RouteResult<T>>,
    {
        let was_probe = self.admit(key)?;
        let mut cancel = CancelGuard {
            breaker: self,
            key,
            was_probe,
            armed: true,
        };

        let result = operation().await;

        cancel.armed = false;
        match &result {
            Ok(_) => self.on_success(key, was_probe),
            Err(_) => self.on_failure(key, was_probe),
        }

        result
    }

    /// Current state for a key. Keys are created lazily, so an unseen key
    /// reports Closed.
    pub fn state(&self, key: &str) -> CircuitState {
        let circuits = self.entries();
        match circuits.get(key) {
            Some(entry) => {
                // Report the post-timeout state even if no call has arrived.
                if entry.state == CircuitState::Open && self.recovery_elapsed(entry) {
                    CircuitState::HalfOpen
                } else {
                    entry.state
                }
            }
            None => CircuitState::Closed,
        }
    }

    /// Admission check. Returns whether this call runs as a half-open probe.
    fn admit(&self, key: &str) -> RouteResult<bool> {
        let mut circuits = self.entries();
        let entry = circuits
            .entry(key.to_string())
            .or_insert_with(CircuitEntry::new);

        match entry.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                if self.recovery_elapsed(entry) {
                    tracing::info!(backend = key, "circuit half-open, admitting trial call");
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_in_flight = 1;
                    Ok(true)
                } else {
                    let retry_after = self.retry_after(entry);
                    Err(RouteError::CircuitOpen {
                        backend: key.to_string(),
                        retry_after,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.half_open_in_flight < self.config.half_open_max_calls {
                    entry.half_open_in_flight += 1;
                    Ok(true)
                } else {
                    Err(RouteError::CircuitOpen {
                        backend: key.to_string(),
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    fn on_success(&self, key: &str, was_probe: bool) {
        let mut circuits = self.entries();
        let Some(entry) = circuits.get_mut(key) else {
            return;
        };

        if was_probe && entry.half_open_in_flight > 0 {
            entry.half_open_in_flight -= 1;
        }

        if entry.state != CircuitState::Closed {
            tracing::info!(backend = key, "circuit closed after successful trial call");
        }
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.opened_at = None;
        entry.half_open_in_flight = 0;
    }

    fn on_failure(&self, key: &str, was_probe: bool) {
        let mut circuits = self.entries();
        let Some(entry) = circuits.get_mut(key) else {
            return;
        };

        entry.last_failure = Some(Instant::now());

        if was_probe {
            // Any half-open failure reopens and restarts the recovery timer.
            tracing::warn!(backend = key, "trial call failed, circuit reopened");
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
            entry.half_open_in_flight = 0;
            return;
        }

        entry.failure_count += 1;
        if entry.state == CircuitState::Closed
            && entry.failure_count >= self.config.failure_threshold
        {
            tracing::warn!(
                backend = key,
                failures = entry.failure_count,
                "failure threshold reached, circuit opened"
            );
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    /// Short critical sections only; the lock is never held across an await,
    /// which is what lets [`CancelGuard`] reach the state from `Drop`.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, CircuitEntry>> {
        match self.circuits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn recovery_elapsed(&self, entry: &CircuitEntry) -> bool {
        entry
            .opened_at
            .map(|t| t.elapsed() >= self.config.recovery_timeout)
            .unwrap_or(true)
    }

    fn retry_after(&self, entry: &CircuitEntry) -> Duration {
        entry
            .opened_at
            .map(|t| self.config.recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Records an admitted call as a failure if it is dropped before resolving.
/// Disarmed once the operation completes either way.
struct CancelGuard<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    was_probe: bool,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                backend = self.key,
                "call cancelled mid-flight, counting as circuit failure"
            );
            self.breaker.on_failure(self.key, self.was_probe);
        }
    }
}
