//! # breakwater-runtime
//!
//! Layered fault tolerance for calls to unreliable downstream services.
//!
//! The engine composes four layers behind one façade:
//! - a token-bucket [`RateLimiter`] gating admission,
//! - a [`RetryStrategy`] with exponential backoff, jitter, and a shared
//!   per-service retry budget,
//! - a [`DegradationManager`] running prioritized fallbacks for unhealthy
//!   services,
//! - a per-service [`CircuitBreaker`] protecting the primary call.
//!
//! ## Key Guarantees
//!
//! 1. **Fail fast**: an open circuit rejects calls without invoking the
//!    operation.
//! 2. **No retry storms**: jittered backoff plus a shared per-service
//!    retry budget bound the amplification of an outage.
//! 3. **FIFO admission**: queued callers are admitted in arrival order
//!    and never wait past the fairness bound.
//! 4. **Typed failures**: everything the engine raises is a
//!    [`ResilienceError`](breakwater_core::ResilienceError); operation
//!    errors pass through unchanged.
//!
//! ## Example
//!
//! ```rust,ignore
//! use breakwater_core::{OpError, ParamsTable, ServiceConfigRegistry};
//! use breakwater_runtime::ResilienceOrchestrator;
//! use std::sync::Arc;
//!
//! let table = ParamsTable::from_yaml_file("services.yaml")?;
//! let registry = Arc::new(
//!     ServiceConfigRegistry::builder().params_table(table).build()?,
//! );
//! let engine = ResilienceOrchestrator::new(registry);
//!
//! let quote: Quote = engine
//!     .execute_with_resilience("FLIGHTS", "search", || async {
//!         search_flights().await.map_err(adapt_error)
//!     }, None)
//!     .await?;
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod degradation;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;

// Re-export main types at crate root
pub use cache::ResponseCache;
pub use circuit_breaker::{
    BreakerMetrics, CircuitBreaker, DetailedBreakerMetrics, StateChange,
};
pub use degradation::{DegradationManager, DegradedValue, ServiceHealthSnapshot};
pub use metrics::{OperationMetrics, OperationMetricsStore};
pub use orchestrator::{
    ComprehensiveMetrics, HealthLevel, HealthStatus, OrchestratorBuilder, ResilienceOrchestrator,
    ServiceHealthReport,
};
pub use rate_limiter::{RateLimiter, RateLimiterSnapshot};
pub use retry::RetryStrategy;
