//! Retry with exponential backoff, jitter, and storm protection.
//!
//! Delays grow as `base × kind_multiplier × backoff^(attempt−1)`, plus a
//! random jitter fraction, capped at the policy's maximum. Throttled
//! failures back off three times harder and circuit-breaker rejections
//! twice as hard.
//!
//! On top of the per-call attempt budget sits a shared per-service retry
//! budget: once a service has burned its allowance for the current
//! window, further calls abort instead of retrying, so a broad outage
//! cannot amplify itself into a retry storm. The window resets on a
//! fixed boundary rather than sliding, which under-counts bursts that
//! straddle a boundary; kept as documented behavior.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use breakwater_core::{ErrorKind, ResilienceError, RetryParams, ServiceConfig};

#[derive(Debug)]
struct RetryBudget {
    window_start: Instant,
    used: u32,
}

/// Retry executor shared by every service in one orchestrator.
///
/// Stateless per call apart from the per-service budget counters.
#[derive(Debug, Default)]
pub struct RetryStrategy {
    budgets: Mutex<HashMap<String, RetryBudget>>,
}

impl RetryStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` with the service's retry policy.
    ///
    /// Guarantees: a non-retryable error is rethrown immediately; the
    /// operation is invoked at most `max_retries` times; no sleep happens
    /// after the final attempt.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        config: &ServiceConfig,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let retry = &config.params().retry;
        let limits = &config.params().rate_limiter.global_limits;
        let max_attempts = retry.max_retries.max(1);

        let mut attempt = 1u32;
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let kind = error.classify(config.classifier());
            if !kind.is_retryable() || attempt >= max_attempts {
                return Err(error);
            }

            if let Some(used) = self.budget_spent(config.name(), limits) {
                tracing::warn!(
                    service = %config.name(),
                    used,
                    "global retry budget exhausted, aborting instead of retrying"
                );
                return Err(ResilienceError::GlobalRetryLimitExceeded {
                    service: config.name().to_string(),
                    used,
                    window: limits.window,
                });
            }

            let delay = backoff_delay(retry, kind, attempt);
            tracing::debug!(
                service = %config.name(),
                attempt,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            self.note_retry(config.name(), limits.window);
            attempt += 1;
        }
    }

    /// Retries recorded for a service in the current window.
    pub fn retries_in_window(&self, service: &str) -> u32 {
        self.budgets.lock().get(service).map(|b| b.used).unwrap_or(0)
    }

    /// Returns `Some(used)` when the budget for the current window is
    /// already spent. Lazily rolls the window over.
    fn budget_spent(
        &self,
        service: &str,
        limits: &breakwater_core::GlobalRetryLimits,
    ) -> Option<u32> {
        let mut budgets = self.budgets.lock();
        let budget = budgets.entry(service.to_string()).or_insert(RetryBudget {
            window_start: Instant::now(),
            used: 0,
        });
        if budget.window_start.elapsed() >= limits.window {
            budget.window_start = Instant::now();
            budget.used = 0;
        }
        (budget.used >= limits.max_retries).then_some(budget.used)
    }

    fn note_retry(&self, service: &str, window: Duration) {
        let mut budgets = self.budgets.lock();
        let budget = budgets.entry(service.to_string()).or_insert(RetryBudget {
            window_start: Instant::now(),
            used: 0,
        });
        if budget.window_start.elapsed() >= window {
            budget.window_start = Instant::now();
            budget.used = 0;
        }
        budget.used += 1;
    }
}

/// Compute the backoff delay before re-attempt number `attempt + 1`.
fn backoff_delay(retry: &RetryParams, kind: ErrorKind, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let base = retry.base_delay.as_secs_f64()
        * kind.delay_multiplier()
        * retry.backoff_multiplier.powi(exponent);
    let jitter = base * retry.jitter_factor * rand::random::<f64>();
    let capped = (base + jitter).min(retry.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped.max(0.0))
}
