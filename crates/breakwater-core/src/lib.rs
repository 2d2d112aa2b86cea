//! # breakwater-core
//!
//! Deterministic data layer for the Breakwater resilience engine.
//!
//! This crate carries everything the async engine in `breakwater-runtime`
//! needs but that involves no execution of its own:
//! - the closed [`ErrorKind`] classification and the [`OpError`] /
//!   [`ResilienceError`] taxonomy,
//! - serde-able service parameter tables with YAML/JSON loading,
//! - the classifier / health-check / fallback seams,
//! - the explicit, injectable [`ServiceConfigRegistry`].
//!
//! ## Key Guarantees
//!
//! 1. **Closed classification**: retry and circuit-breaking decisions are
//!    driven only by [`ErrorKind`], never by sniffing vendor error shapes.
//! 2. **Immutable configuration**: a built registry is read-only; there
//!    are no ambient singletons to mutate.
//! 3. **Validated at the boundary**: every parameter table is bounds-
//!    checked before a registry will accept it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use breakwater_core::{ParamsTable, ServiceConfigRegistry};
//!
//! let table = ParamsTable::from_yaml_file("services.yaml")?;
//! let registry = ServiceConfigRegistry::builder()
//!     .params_table(table)
//!     .build()?;
//! ```

pub mod config;
pub mod error;
pub mod registry;
pub mod service;

// Re-export main types at crate root
pub use config::{
    ConfigError, GlobalRetryLimits, ParamsTable, RateLimiterParams, RecoveryCriteria, RetryParams,
    ServiceParams,
};
pub use error::{ErrorKind, OpError, ResilienceError};
pub use registry::{RegistryBuilder, ServiceConfigRegistry};
pub use service::{
    default_classifier, AlwaysHealthy, BoxFuture, CallContext, CircuitState, ClassifierFn,
    DegradationStrategy, FallbackFn, FallbackMethod, FnHealthCheck, HealthCheck, ServiceConfig,
};
