//! Top-level façade composing the resilience layers.
//!
//! One call travels: rate-limiter admission → retry loop → degradation
//! manager → circuit breaker → the protected operation. Retries wrap the
//! degradation layer, so a re-attempt gets a fresh shot at the primary
//! and the fallback chain, not just the bare network call. Metrics are
//! recorded at every exit point.
//!
//! Note on timeouts: the configured windows feed failure counting and
//! backoff only. The engine imposes no hard task-kill timeout, and a
//! caller that abandons the outer future does not cancel bookkeeping
//! already in flight.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use breakwater_core::{
    CallContext, CircuitState, OpError, ResilienceError, ServiceConfig, ServiceConfigRegistry,
};

use crate::cache::ResponseCache;
use crate::circuit_breaker::{CircuitBreaker, DetailedBreakerMetrics, StateChange};
use crate::degradation::{DegradationManager, ServiceHealthSnapshot};
use crate::metrics::{OperationMetrics, OperationMetricsStore};
use crate::rate_limiter::{RateLimiter, RateLimiterSnapshot};
use crate::retry::RetryStrategy;

/// Coarse health classification of a service or the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health classification for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthReport {
    pub level: HealthLevel,
    pub circuit_state: CircuitState,
    pub success_rate: f64,
}

/// System-wide health view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub health_score: f64,
    pub services: BTreeMap<String, ServiceHealthReport>,
}

/// Everything observable about the engine, as plain data.
#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveMetrics {
    pub generated_at: DateTime<Utc>,
    pub health_score: f64,
    pub operations: BTreeMap<String, OperationMetrics>,
    pub circuit_breakers: BTreeMap<String, DetailedBreakerMetrics>,
    pub rate_limiters: BTreeMap<String, RateLimiterSnapshot>,
    pub degradation: BTreeMap<String, ServiceHealthSnapshot>,
}

/// Builder for [`ResilienceOrchestrator`].
pub struct OrchestratorBuilder {
    registry: Arc<ServiceConfigRegistry>,
    cache_entries: u64,
    cache_ttl: Duration,
}

impl OrchestratorBuilder {
    /// Maximum entries in the last-good response cache.
    pub fn cache_entries(mut self, entries: u64) -> Self {
        self.cache_entries = entries;
        self
    }

    /// TTL of last-good responses.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Build the orchestrator and start its background tasks. Must be
    /// called from within a tokio runtime.
    pub fn build(self) -> ResilienceOrchestrator {
        let mut breakers = HashMap::with_capacity(self.registry.len());
        let mut limiters = HashMap::with_capacity(self.registry.len());
        for config in self.registry.iter() {
            breakers.insert(
                config.name().to_string(),
                Arc::new(CircuitBreaker::new(Arc::clone(config))),
            );
            limiters.insert(
                config.name().to_string(),
                Arc::new(RateLimiter::new(config.name(), &config.params().rate_limiter)),
            );
        }
        ResilienceOrchestrator {
            degradation: DegradationManager::new(Arc::clone(&self.registry)),
            registry: self.registry,
            breakers,
            limiters,
            retry: RetryStrategy::new(),
            metrics: OperationMetricsStore::new(),
            cache: ResponseCache::new(self.cache_entries, self.cache_ttl),
        }
    }
}

/// The resilience engine façade.
///
/// Constructed once at process start from an explicit registry and
/// injected wherever protected calls are made.
pub struct ResilienceOrchestrator {
    registry: Arc<ServiceConfigRegistry>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    limiters: HashMap<String, Arc<RateLimiter>>,
    retry: RetryStrategy,
    degradation: DegradationManager,
    metrics: OperationMetricsStore,
    cache: ResponseCache,
}

impl ResilienceOrchestrator {
    /// Build with default cache sizing.
    pub fn new(registry: Arc<ServiceConfigRegistry>) -> Self {
        Self::builder(registry).build()
    }

    pub fn builder(registry: Arc<ServiceConfigRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            cache_entries: 10_000,
            cache_ttl: Duration::from_secs(600),
        }
    }

    /// Run one operation through the full resilience stack.
    pub async fn execute_with_resilience<T, F, Fut>(
        &self,
        service: &str,
        operation: &str,
        op: F,
        context: Option<Value>,
    ) -> Result<T, ResilienceError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        let config = self
            .registry
            .get(service)
            .ok_or_else(|| ResilienceError::UnknownService(service.to_string()))?;
        let name = config.name().to_string();
        let breaker = self
            .breakers
            .get(&name)
            .ok_or_else(|| ResilienceError::UnknownService(name.clone()))?;
        let limiter = self
            .limiters
            .get(&name)
            .ok_or_else(|| ResilienceError::UnknownService(name.clone()))?;

        let started = Instant::now();

        if let Err(error) = limiter.acquire().await {
            self.metrics
                .record_failure(&name, operation, started.elapsed(), 0, breaker.state());
            return Err(error);
        }

        let ctx_template = CallContext {
            service: name.clone(),
            operation: operation.to_string(),
            payload: context,
        };
        let attempts = AtomicU32::new(0);
        let op_ref = &op;
        let degradation = &self.degradation;

        let result = self
            .retry
            .execute_with_retry(&config, || {
                attempts.fetch_add(1, Ordering::Relaxed);
                let ctx = ctx_template.clone();
                let breaker = Arc::clone(breaker);
                let config = Arc::clone(&config);
                async move {
                    degradation
                        .execute_with_degradation(&config, || breaker.execute(|| op_ref()), ctx)
                        .await
                }
            })
            .await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        let elapsed = started.elapsed();

        match result {
            Ok(degraded) => {
                self.metrics.record_success(
                    &name,
                    operation,
                    elapsed,
                    retries,
                    degraded.via_fallback.is_some(),
                    breaker.state(),
                );
                if config.params().serve_stale {
                    if let Ok(raw) = serde_json::to_value(&degraded.value) {
                        self.cache.put(&name, operation, raw).await;
                    }
                }
                Ok(degraded.value)
            }
            Err(error) => {
                if config.params().serve_stale && stale_eligible(&error, &config) {
                    if let Some(raw) = self.cache.get(&name, operation).await {
                        if let Ok(value) = serde_json::from_value::<T>(raw) {
                            tracing::warn!(
                                service = %name,
                                operation,
                                error = %error,
                                "stack exhausted, serving stale cached response"
                            );
                            self.metrics.record_success(
                                &name,
                                operation,
                                elapsed,
                                retries,
                                true,
                                breaker.state(),
                            );
                            return Ok(value);
                        }
                    }
                }
                self.metrics
                    .record_failure(&name, operation, elapsed, retries, breaker.state());
                Err(error)
            }
        }
    }

    /// Per-operation stats, breaker and limiter states, degradation
    /// health, and the aggregate score, suitable for JSON export.
    pub fn comprehensive_metrics(&self) -> ComprehensiveMetrics {
        let circuit_breakers: BTreeMap<String, DetailedBreakerMetrics> = self
            .breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.detailed_metrics()))
            .collect();
        let rate_limiters = self
            .limiters
            .iter()
            .map(|(name, l)| (name.clone(), l.snapshot()))
            .collect();
        ComprehensiveMetrics {
            generated_at: Utc::now(),
            health_score: self.health_score(),
            operations: self.metrics.snapshot(),
            circuit_breakers,
            rate_limiters,
            degradation: self.degradation.health_snapshot(),
        }
    }

    /// Classify every service and the system overall.
    ///
    /// An open circuit means unhealthy; a half-open circuit or a rolling
    /// success rate below 0.9 means degraded. The overall level derives
    /// from the fraction of healthy breakers with degraded ones counted
    /// at half credit.
    pub fn health_status(&self) -> HealthStatus {
        let mut services = BTreeMap::new();
        for (name, breaker) in &self.breakers {
            let detailed = breaker.detailed_metrics();
            let level = match detailed.metrics.state {
                CircuitState::Open => HealthLevel::Unhealthy,
                CircuitState::HalfOpen => HealthLevel::Degraded,
                CircuitState::Closed if detailed.success_rate < 0.9 => HealthLevel::Degraded,
                CircuitState::Closed => HealthLevel::Healthy,
            };
            services.insert(
                name.clone(),
                ServiceHealthReport {
                    level,
                    circuit_state: detailed.metrics.state,
                    success_rate: detailed.success_rate,
                },
            );
        }

        let health_score = score_of(services.values().map(|s| s.level));
        let overall = if health_score >= 0.9 {
            HealthLevel::Healthy
        } else if health_score >= 0.5 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Unhealthy
        };

        HealthStatus {
            overall,
            health_score,
            services,
        }
    }

    /// Detailed breaker metrics for one service.
    pub fn detailed_metrics(&self, service: &str) -> Option<DetailedBreakerMetrics> {
        self.breakers
            .get(&service.to_ascii_uppercase())
            .map(|b| b.detailed_metrics())
    }

    /// Subscribe to a service's circuit state transitions.
    pub fn subscribe(&self, service: &str) -> Option<tokio::sync::broadcast::Receiver<StateChange>> {
        self.breakers
            .get(&service.to_ascii_uppercase())
            .map(|b| b.subscribe())
    }

    /// Force every breaker closed and drop every operation metric.
    /// Administrative escape hatch.
    pub fn reset_all(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
        self.metrics.reset();
        tracing::info!("all circuit breakers and operation metrics reset");
    }

    /// Stop every background task and reject queued callers. The
    /// orchestrator is unusable afterwards.
    pub fn shutdown(&self) {
        for limiter in self.limiters.values() {
            limiter.destroy();
        }
        for breaker in self.breakers.values() {
            breaker.destroy();
        }
        self.degradation.destroy();
        self.cache.invalidate_all();
    }

    fn health_score(&self) -> f64 {
        score_of(self.health_levels())
    }

    fn health_levels(&self) -> impl Iterator<Item = HealthLevel> + '_ {
        self.breakers.values().map(|breaker| {
            let detailed = breaker.detailed_metrics();
            match detailed.metrics.state {
                CircuitState::Open => HealthLevel::Unhealthy,
                CircuitState::HalfOpen => HealthLevel::Degraded,
                CircuitState::Closed if detailed.success_rate < 0.9 => HealthLevel::Degraded,
                CircuitState::Closed => HealthLevel::Healthy,
            }
        })
    }
}

/// Fraction of healthy breakers, with degraded ones at half credit.
fn score_of(levels: impl Iterator<Item = HealthLevel>) -> f64 {
    let mut total = 0usize;
    let mut score = 0.0f64;
    for level in levels {
        total += 1;
        score += match level {
            HealthLevel::Healthy => 1.0,
            HealthLevel::Degraded => 0.5,
            HealthLevel::Unhealthy => 0.0,
        };
    }
    if total == 0 {
        1.0
    } else {
        score / total as f64
    }
}

/// Stale responses only stand in for availability-class failures; a
/// terminal domain error must reach the caller unchanged.
fn stale_eligible(error: &ResilienceError, config: &ServiceConfig) -> bool {
    matches!(error, ResilienceError::GlobalRetryLimitExceeded { .. })
        || error.classify(config.classifier()).is_retryable()
}
