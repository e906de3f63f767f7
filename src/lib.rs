//! # Inference Gateway
//!
//! Resilient routing core for natural-language requests over interchangeable
//! third-party inference backends.
//!
//! This library provides:
//! - Budget- and capability-aware backend selection
//! - Per-backend circuit breaking and per-caller rate limiting
//! - Bounded retries with exponential backoff
//! - A deterministic similarity-based fallback when no backend is usable
//!
//! ## Request Flow
//!
//! ```text
//!          ┌────────────────────────────────────────────┐
//!          │               RequestRouter                │
//!          └──────┬─────────────┬────────────┬──────────┘
//!                 │             │            │
//!                 ▼             ▼            ▼
//!          ModelSelector   RateLimiter  CircuitBreaker
//!                 │             │            │
//!                 ▼             ▼            ▼
//!          BudgetTracker   LedgerStore  InferenceBackend
//!                 │                          │
//!                 └──────────┬───────────────┘
//!                            ▼ (on exhaustion)
//!                    FallbackResponder
//! ```
//!
//! 1. The selector ranks candidate backends by quality, cost, speed and
//!    history, filtered by budget and capabilities.
//! 2. The rate limiter admits or denies before any backend is touched.
//! 3. Calls go through a per-backend circuit breaker with bounded retries.
//! 4. Every attempt lands in the usage ledger, which feeds the budget
//!    tracker and the selector's history term.
//! 5. When no backend can answer, the fallback responder computes a
//!    deterministic, explicitly-degraded similarity ranking instead.
//!
//! ## Modules
//! - `similarity`: pure vector math (cosine, batch ranking, diversity)
//! - `breaker`: per-dependency circuit breaker
//! - `ratelimit`: per-caller admission control
//! - `budget`: ledger-derived budget view
//! - `selector`: candidate scoring and ranking
//! - `router`: orchestration and the public `generate` surface
//! - `fallback`: degraded non-AI answers

pub mod backend;
pub mod breaker;
pub mod budget;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fallback;
pub mod ledger;
pub mod ratelimit;
pub mod router;
pub mod selector;
pub mod similarity;

pub use backend::{BackendRegistry, BackendResponse, HttpBackend, InferenceBackend};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use budget::{BudgetConfig, BudgetStatus, BudgetTracker};
pub use catalog::{BackendDescriptor, ModelCatalog, StaticCatalog};
pub use config::GatewayConfig;
pub use error::{RouteError, RouteResult, SimilarityError};
pub use fallback::{CallerProfile, FallbackCandidate, FallbackResponder, FallbackResult};
pub use ledger::{LedgerStore, SqliteLedger, UsageRecord};
pub use ratelimit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use router::{GeneratePreferences, GenerateResponse, RequestRouter};
pub use selector::{ModelSelection, ModelSelector, Priority, SelectionRequirements};
