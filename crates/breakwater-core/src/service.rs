//! Service configuration: the seam between the engine and its callers.
//!
//! A [`ServiceConfig`] joins the serde-able [`ServiceParams`] with the
//! programmatic pieces the engine cannot load from a file: the error
//! classifier, the health check, and the optional degradation strategy.
//! All three are supplied by the vendor-specific adapter that constructs
//! the registry; the engine itself never inspects raw error fields.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::config::{RecoveryCriteria, ServiceParams};
use crate::error::{ErrorKind, OpError};

/// Boxed future used at every closure seam.
pub type BoxFuture<T> = futures::future::BoxFuture<'static, T>;

/// Pure function mapping an operation error to its classification.
pub type ClassifierFn = Arc<dyn Fn(&OpError) -> ErrorKind + Send + Sync>;

/// Async function executing one fallback attempt.
pub type FallbackFn = Arc<dyn Fn(CallContext) -> BoxFuture<Result<Value, OpError>> + Send + Sync>;

/// State of a service's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// The downstream is failing, calls are rejected.
    Open,
    /// Probing whether the downstream has recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Asynchronous health probe for a service or a single fallback.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Whether the probed target currently looks usable. Probe transport
    /// failures are reported as `false`, never raised.
    async fn check(&self) -> bool;
}

/// Adapter turning an async closure into a [`HealthCheck`].
pub struct FnHealthCheck<F>(pub F);

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = bool> + Send,
{
    async fn check(&self) -> bool {
        (self.0)().await
    }
}

/// Probe that always passes. Used when a service registers no probe.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn check(&self) -> bool {
        true
    }
}

/// Call-scoped information handed to fallback methods.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Service the call targets.
    pub service: String,

    /// Operation name within the service.
    pub operation: String,

    /// Caller-supplied payload, if any.
    pub payload: Option<Value>,
}

/// One entry in a service's fallback chain.
pub struct FallbackMethod {
    /// Name, used in logs and degradation accounting.
    pub name: String,

    /// Position in the chain; lower runs first.
    pub priority: u32,

    execute: FallbackFn,
    health_check: Option<Arc<dyn HealthCheck>>,
}

impl FallbackMethod {
    /// Create a fallback from an async closure producing a JSON value.
    pub fn new<F>(name: impl Into<String>, priority: u32, execute: F) -> Self
    where
        F: Fn(CallContext) -> BoxFuture<Result<Value, OpError>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority,
            execute: Arc::new(execute),
            health_check: None,
        }
    }

    /// Gate this fallback behind its own health probe.
    pub fn with_health_check(mut self, check: impl HealthCheck + 'static) -> Self {
        self.health_check = Some(Arc::new(check));
        self
    }

    /// Run the fallback.
    pub async fn invoke(&self, ctx: CallContext) -> Result<Value, OpError> {
        (self.execute)(ctx).await
    }

    /// Whether the fallback's own probe passes. Absent probe means usable.
    pub async fn usable(&self) -> bool {
        match &self.health_check {
            Some(check) => check.check().await,
            None => true,
        }
    }
}

impl fmt::Debug for FallbackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackMethod")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("has_health_check", &self.health_check.is_some())
            .finish_non_exhaustive()
    }
}

/// Ordered fallback chain plus recovery criteria for one service.
pub struct DegradationStrategy {
    fallbacks: Vec<FallbackMethod>,
    /// When a degraded service may be considered recovered.
    pub recovery: RecoveryCriteria,
}

impl DegradationStrategy {
    /// Build a strategy. Fallbacks are kept sorted by ascending priority.
    pub fn new(mut fallbacks: Vec<FallbackMethod>, recovery: RecoveryCriteria) -> Self {
        fallbacks.sort_by_key(|f| f.priority);
        Self { fallbacks, recovery }
    }

    /// Fallbacks in execution order.
    pub fn fallbacks(&self) -> &[FallbackMethod] {
        &self.fallbacks
    }
}

impl fmt::Debug for DegradationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationStrategy")
            .field("fallbacks", &self.fallbacks)
            .field("recovery", &self.recovery)
            .finish()
    }
}

/// Complete configuration for one protected service.
pub struct ServiceConfig {
    name: String,
    params: ServiceParams,
    classifier: ClassifierFn,
    health_check: Arc<dyn HealthCheck>,
    degradation: Option<DegradationStrategy>,
}

impl ServiceConfig {
    /// Create a configuration with the default classifier (built from the
    /// retry policy's code lists) and an always-passing health probe.
    ///
    /// The name is normalized to uppercase.
    pub fn new(name: impl Into<String>, params: ServiceParams) -> Self {
        let classifier = default_classifier(
            params.retry.retryable_errors.clone(),
            params.retry.non_retryable_errors.clone(),
        );
        Self {
            name: name.into().to_ascii_uppercase(),
            params,
            classifier,
            health_check: Arc::new(AlwaysHealthy),
            degradation: None,
        }
    }

    /// Replace the error classifier.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&OpError) -> ErrorKind + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Replace the health probe.
    pub fn with_health_check(mut self, check: impl HealthCheck + 'static) -> Self {
        self.health_check = Arc::new(check);
        self
    }

    /// Attach a degradation strategy.
    pub fn with_degradation(mut self, strategy: DegradationStrategy) -> Self {
        self.degradation = Some(strategy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &ServiceParams {
        &self.params
    }

    pub fn classifier(&self) -> &ClassifierFn {
        &self.classifier
    }

    /// Classify an operation error through this service's classifier.
    pub fn classify(&self, error: &OpError) -> ErrorKind {
        (self.classifier)(error)
    }

    pub fn health_check(&self) -> Arc<dyn HealthCheck> {
        Arc::clone(&self.health_check)
    }

    pub fn degradation(&self) -> Option<&DegradationStrategy> {
        self.degradation.as_ref()
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("degradation", &self.degradation)
            .finish_non_exhaustive()
    }
}

/// Default classifier: exact code-list matches first, then HTTP status
/// conventions. Anything without a recognizable shape is treated as a
/// transport-level failure.
pub fn default_classifier(retryable: Vec<String>, non_retryable: Vec<String>) -> ClassifierFn {
    Arc::new(move |error: &OpError| {
        let code = error
            .code
            .as_deref()
            .or(error.name.as_deref())
            .unwrap_or_default();
        if !code.is_empty() {
            if non_retryable.iter().any(|c| c == code) {
                return ErrorKind::NonRetryable;
            }
            if retryable.iter().any(|c| c == code) {
                return ErrorKind::Retryable;
            }
        }
        match error.status {
            Some(401) => ErrorKind::Authentication,
            Some(403) => ErrorKind::Authorization,
            Some(404) => ErrorKind::NotFound,
            Some(409) => ErrorKind::Conflict,
            Some(400) | Some(422) => ErrorKind::Validation,
            Some(429) => ErrorKind::Throttling,
            Some(503) => ErrorKind::ServiceUnavailable,
            Some(status) if (500..=599).contains(&status) => ErrorKind::Retryable,
            Some(_) => ErrorKind::NonRetryable,
            None => ErrorKind::Network,
        }
    })
}
