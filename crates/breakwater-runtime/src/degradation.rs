//! Graceful degradation with prioritized fallbacks.
//!
//! Each service carries a health flag, initially healthy. A healthy
//! service runs its primary operation; when that fails (or the service
//! is already marked unhealthy) the registered fallback chain runs in
//! ascending priority order until one succeeds. Fallbacks with their own
//! health check are skipped while that check fails.
//!
//! A background recovery loop probes every unhealthy service and flips
//! it back once enough consecutive probes pass. Probe failures reset the
//! streak; they never crash the loop.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use breakwater_core::{
    CallContext, DegradationStrategy, ResilienceError, ServiceConfig, ServiceConfigRegistry,
};

/// How often the recovery loop scans for unhealthy services.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// A value produced by the degradation layer, annotated with the
/// fallback that produced it, if any.
#[derive(Debug, Clone)]
pub struct DegradedValue<T> {
    pub value: T,
    pub via_fallback: Option<String>,
}

#[derive(Debug, Clone)]
struct ServiceHealth {
    healthy: bool,
    consecutive_probe_successes: u32,
    streak_started_at: Option<Instant>,
    last_probe_at: Option<Instant>,
    unhealthy_since: Option<DateTime<Utc>>,
    fallback_uses: u64,
    deepest_fallback_priority: Option<u32>,
}

impl ServiceHealth {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_probe_successes: 0,
            streak_started_at: None,
            last_probe_at: None,
            unhealthy_since: None,
            fallback_uses: 0,
            deepest_fallback_priority: None,
        }
    }
}

/// Exported view of one service's degradation state.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthSnapshot {
    pub healthy: bool,
    pub consecutive_probe_successes: u32,
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub fallback_uses: u64,
    pub deepest_fallback_priority: Option<u32>,
}

struct Shared {
    registry: Arc<ServiceConfigRegistry>,
    health: Mutex<HashMap<String, ServiceHealth>>,
}

impl Shared {
    /// One pass of the recovery loop: probe unhealthy services whose
    /// probe spacing has elapsed, then apply the recovery criteria.
    async fn run_recovery_pass(&self) {
        let due: Vec<Arc<ServiceConfig>> = {
            let health = self.health.lock();
            self.registry
                .iter()
                .filter(|config| {
                    health.get(config.name()).map_or(false, |h| {
                        !h.healthy
                            && h.last_probe_at.map_or(true, |at| {
                                at.elapsed() >= config.params().recovery.health_check_interval
                            })
                    })
                })
                .cloned()
                .collect()
        };

        for config in due {
            let passed = config.health_check().check().await;
            let mut health = self.health.lock();
            let Some(entry) = health.get_mut(config.name()) else {
                continue;
            };
            entry.last_probe_at = Some(Instant::now());
            if !passed {
                if entry.consecutive_probe_successes > 0 {
                    tracing::debug!(
                        service = %config.name(),
                        "recovery probe failed, success streak reset"
                    );
                }
                entry.consecutive_probe_successes = 0;
                entry.streak_started_at = None;
                continue;
            }

            // A streak only counts while it fits inside the recovery
            // window; stale streaks restart from this probe.
            let window = config.params().recovery.time_window;
            let stale = entry
                .streak_started_at
                .map_or(true, |at| at.elapsed() > window);
            if stale {
                entry.consecutive_probe_successes = 0;
                entry.streak_started_at = Some(Instant::now());
            }
            entry.consecutive_probe_successes += 1;
            if entry.consecutive_probe_successes
                >= config.params().recovery.consecutive_successes
            {
                entry.healthy = true;
                entry.consecutive_probe_successes = 0;
                entry.streak_started_at = None;
                entry.unhealthy_since = None;
                entry.fallback_uses = 0;
                entry.deepest_fallback_priority = None;
                tracing::info!(
                    service = %config.name(),
                    "service recovered, routing primary traffic again"
                );
            }
        }
    }
}

/// Degradation manager shared by every service in one orchestrator.
pub struct DegradationManager {
    shared: Arc<Shared>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl DegradationManager {
    /// Create a manager and start its recovery loop. Must be called from
    /// within a tokio runtime.
    pub fn new(registry: Arc<ServiceConfigRegistry>) -> Self {
        let mut health = HashMap::with_capacity(registry.len());
        for config in registry.iter() {
            health.insert(config.name().to_string(), ServiceHealth::new());
        }
        let shared = Arc::new(Shared {
            registry,
            health: Mutex::new(health),
        });

        let loop_shared = Arc::clone(&shared);
        let recovery_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECOVERY_INTERVAL).await;
                loop_shared.run_recovery_pass().await;
            }
        });

        Self {
            shared,
            recovery_task: Mutex::new(Some(recovery_task)),
        }
    }

    /// Run the primary operation with fallback coverage.
    ///
    /// A service without a registered strategy always attempts the
    /// primary and propagates its failure directly. With a strategy, a
    /// primary failure marks the service unhealthy and runs the chain;
    /// an already-unhealthy service goes straight to the chain until the
    /// recovery loop clears it.
    pub async fn execute_with_degradation<T, F, Fut>(
        &self,
        config: &ServiceConfig,
        primary: F,
        ctx: CallContext,
    ) -> Result<DegradedValue<T>, ResilienceError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let Some(strategy) = config.degradation() else {
            let value = primary().await?;
            self.mark_healthy(config.name());
            return Ok(DegradedValue {
                value,
                via_fallback: None,
            });
        };

        if self.is_healthy(config.name()) {
            match primary().await {
                Ok(value) => {
                    self.mark_healthy(config.name());
                    return Ok(DegradedValue {
                        value,
                        via_fallback: None,
                    });
                }
                Err(error) => {
                    self.mark_unhealthy(config.name());
                    tracing::warn!(
                        service = %config.name(),
                        error = %error,
                        "primary failed, entering fallback chain"
                    );
                    return self.run_fallbacks(config, strategy, ctx, Some(error)).await;
                }
            }
        }

        tracing::debug!(
            service = %config.name(),
            "service marked unhealthy, skipping primary"
        );
        self.run_fallbacks(config, strategy, ctx, None).await
    }

    /// Whether a service is currently marked healthy. Unknown services
    /// are treated as healthy.
    pub fn is_healthy(&self, service: &str) -> bool {
        self.shared
            .health
            .lock()
            .get(service)
            .map_or(true, |h| h.healthy)
    }

    /// Per-service degradation state, snapshot copy.
    pub fn health_snapshot(&self) -> BTreeMap<String, ServiceHealthSnapshot> {
        self.shared
            .health
            .lock()
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
                    ServiceHealthSnapshot {
                        healthy: h.healthy,
                        consecutive_probe_successes: h.consecutive_probe_successes,
                        unhealthy_since: h.unhealthy_since,
                        fallback_uses: h.fallback_uses,
                        deepest_fallback_priority: h.deepest_fallback_priority,
                    },
                )
            })
            .collect()
    }

    /// Stop the recovery loop.
    pub fn destroy(&self) {
        if let Some(task) = self.recovery_task.lock().take() {
            task.abort();
        }
    }

    async fn run_fallbacks<T: DeserializeOwned>(
        &self,
        config: &ServiceConfig,
        strategy: &DegradationStrategy,
        ctx: CallContext,
        primary_error: Option<ResilienceError>,
    ) -> Result<DegradedValue<T>, ResilienceError> {
        // An empty chain behaves like no strategy at all.
        if strategy.fallbacks().is_empty() {
            if let Some(error) = primary_error {
                return Err(error);
            }
        }

        let mut reasons = Vec::new();
        if let Some(error) = &primary_error {
            reasons.push(format!("primary: {error}"));
        }

        for fallback in strategy.fallbacks() {
            if !fallback.usable().await {
                tracing::debug!(
                    service = %config.name(),
                    fallback = %fallback.name,
                    "fallback health check failed, skipping"
                );
                continue;
            }
            match fallback.invoke(ctx.clone()).await {
                Ok(raw) => {
                    self.note_fallback_used(config.name(), fallback.priority);
                    tracing::info!(
                        service = %config.name(),
                        fallback = %fallback.name,
                        priority = fallback.priority,
                        "fallback succeeded"
                    );
                    let value: T = serde_json::from_value(raw).map_err(|e| {
                        ResilienceError::FallbackDecode {
                            service: config.name().to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                    return Ok(DegradedValue {
                        value,
                        via_fallback: Some(fallback.name.clone()),
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        service = %config.name(),
                        fallback = %fallback.name,
                        error = %error,
                        "fallback failed"
                    );
                    reasons.push(format!("{}: {error}", fallback.name));
                }
            }
        }

        Err(ResilienceError::AllFallbacksFailed {
            service: config.name().to_string(),
            attempted: strategy.fallbacks().len(),
            reasons,
        })
    }

    fn mark_healthy(&self, service: &str) {
        let mut health = self.shared.health.lock();
        let entry = health
            .entry(service.to_string())
            .or_insert_with(ServiceHealth::new);
        if !entry.healthy {
            tracing::info!(service = %service, "primary succeeded, service healthy again");
        }
        entry.healthy = true;
        entry.consecutive_probe_successes = 0;
        entry.streak_started_at = None;
        entry.unhealthy_since = None;
        entry.fallback_uses = 0;
        entry.deepest_fallback_priority = None;
    }

    fn mark_unhealthy(&self, service: &str) {
        let mut health = self.shared.health.lock();
        let entry = health
            .entry(service.to_string())
            .or_insert_with(ServiceHealth::new);
        if entry.healthy {
            entry.unhealthy_since = Some(Utc::now());
        }
        entry.healthy = false;
        entry.consecutive_probe_successes = 0;
        entry.streak_started_at = None;
    }

    fn note_fallback_used(&self, service: &str, priority: u32) {
        let mut health = self.shared.health.lock();
        let entry = health
            .entry(service.to_string())
            .or_insert_with(ServiceHealth::new);
        entry.fallback_uses += 1;
        entry.deepest_fallback_priority = Some(
            entry
                .deepest_fallback_priority
                .map_or(priority, |p| p.max(priority)),
        );
    }
}

impl Drop for DegradationManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
