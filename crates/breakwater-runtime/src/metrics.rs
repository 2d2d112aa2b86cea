//! Rolling per-operation metrics.
//!
//! Every (service:operation) pair gets an entry on first use, updated at
//! each call exit with a moving-average latency, a bounded latency sample
//! for approximate p95, and success/failure streaks. Entries idle past
//! the retention window are garbage-collected during normal updates.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use breakwater_core::CircuitState;

/// Idle entries older than this are dropped.
const RETENTION: Duration = Duration::from_secs(300);

/// Bounded latency sample per entry, enough for a stable p95.
const LATENCY_SAMPLES: usize = 128;

#[derive(Debug)]
struct OpStats {
    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    avg_response_ms: f64,
    samples: VecDeque<f64>,
    circuit_state: CircuitState,
    last_failure_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    retry_count: u64,
    fallback_uses: u64,
    last_activity: Instant,
}

impl OpStats {
    fn new() -> Self {
        Self {
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            avg_response_ms: 0.0,
            samples: VecDeque::with_capacity(LATENCY_SAMPLES),
            circuit_state: CircuitState::Closed,
            last_failure_at: None,
            consecutive_failures: 0,
            retry_count: 0,
            fallback_uses: 0,
            last_activity: Instant::now(),
        }
    }

    fn observe(&mut self, elapsed: Duration, retries: u32, state: CircuitState) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.total_requests += 1;
        self.avg_response_ms += (ms - self.avg_response_ms) / self.total_requests as f64;
        if self.samples.len() == LATENCY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
        self.retry_count += retries as u64;
        self.circuit_state = state;
        self.last_activity = Instant::now();
    }

    fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }
}

/// Snapshot of one operation's rolling metrics.
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetrics {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub circuit_state: CircuitState,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub retry_count: u64,
    pub fallback_uses: u64,
}

/// Store of per-(service:operation) metrics.
#[derive(Debug, Default)]
pub struct OperationMetricsStore {
    inner: Mutex<HashMap<String, OpStats>>,
}

impl OperationMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(service: &str, operation: &str) -> String {
        format!("{service}:{operation}")
    }

    pub fn record_success(
        &self,
        service: &str,
        operation: &str,
        elapsed: Duration,
        retries: u32,
        via_fallback: bool,
        state: CircuitState,
    ) {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner);
        let stats = inner
            .entry(Self::key(service, operation))
            .or_insert_with(OpStats::new);
        stats.observe(elapsed, retries, state);
        stats.success_count += 1;
        stats.consecutive_failures = 0;
        if via_fallback {
            stats.fallback_uses += 1;
        }
    }

    pub fn record_failure(
        &self,
        service: &str,
        operation: &str,
        elapsed: Duration,
        retries: u32,
        state: CircuitState,
    ) {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner);
        let stats = inner
            .entry(Self::key(service, operation))
            .or_insert_with(OpStats::new);
        stats.observe(elapsed, retries, state);
        stats.failure_count += 1;
        stats.consecutive_failures += 1;
        stats.last_failure_at = Some(Utc::now());
    }

    /// Snapshot of every live entry.
    pub fn snapshot(&self) -> BTreeMap<String, OperationMetrics> {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner);
        inner
            .iter()
            .map(|(key, stats)| {
                let success_rate = if stats.total_requests == 0 {
                    1.0
                } else {
                    stats.success_count as f64 / stats.total_requests as f64
                };
                (
                    key.clone(),
                    OperationMetrics {
                        total_requests: stats.total_requests,
                        success_count: stats.success_count,
                        failure_count: stats.failure_count,
                        success_rate,
                        avg_response_ms: stats.avg_response_ms,
                        p95_response_ms: stats.p95(),
                        circuit_state: stats.circuit_state,
                        last_failure_at: stats.last_failure_at,
                        consecutive_failures: stats.consecutive_failures,
                        retry_count: stats.retry_count,
                        fallback_uses: stats.fallback_uses,
                    },
                )
            })
            .collect()
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    fn sweep(inner: &mut HashMap<String, OpStats>) {
        inner.retain(|_, stats| stats.last_activity.elapsed() < RETENTION);
    }
}
