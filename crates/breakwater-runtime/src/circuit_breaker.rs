//! Per-service circuit breaker.
//!
//! A three-state machine guarding one downstream service:
//!
//! - **Closed**: calls flow through; qualifying failures inside the
//!   counting window accumulate toward the threshold.
//! - **Open**: calls are rejected without being invoked until the reset
//!   timeout elapses. A background probe may move the circuit to
//!   half-open early once the downstream's health check passes.
//! - **HalfOpen**: a bounded number of concurrent probe calls are
//!   admitted; enough successes close the circuit, any qualifying
//!   failure reopens it immediately.
//!
//! Failure accounting is windowed over a bounded request history, pruned
//! to twice the counting window. Non-retryable errors are recorded for
//! observability but never move the state machine.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use breakwater_core::{CircuitState, ErrorKind, OpError, ResilienceError, ServiceConfig};

/// Longest the health probe will wait between attempts while open.
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// One observed call outcome, kept in the sliding history.
#[derive(Debug, Clone)]
struct RequestRecord {
    at: Instant,
    success: bool,
    response_time: Duration,
    kind: Option<ErrorKind>,
}

/// A state transition, published to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Snapshot of a breaker's counters. Always a defensive copy.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub requests: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    pub half_open_calls: u32,
}

/// [`BreakerMetrics`] plus derived statistics over the live window.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedBreakerMetrics {
    #[serde(flatten)]
    pub metrics: BreakerMetrics,
    pub window_requests: usize,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub error_kinds: BTreeMap<String, u64>,
    pub time_in_state_ms: u64,
}

struct Inner {
    state: CircuitState,
    state_changed_at: Instant,
    state_changed_wall: DateTime<Utc>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    history: VecDeque<RequestRecord>,
    requests: u64,
    successes: u64,
    failures: u64,
    kind_counts: HashMap<ErrorKind, u64>,
    last_failure_wall: Option<DateTime<Utc>>,
    last_success_wall: Option<DateTime<Utc>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            state_changed_at: Instant::now(),
            state_changed_wall: Utc::now(),
            half_open_successes: 0,
            half_open_in_flight: 0,
            history: VecDeque::new(),
            requests: 0,
            successes: 0,
            failures: 0,
            kind_counts: HashMap::new(),
            last_failure_wall: None,
            last_success_wall: None,
        }
    }

    /// Append a record and prune anything older than twice the window.
    fn push_record(&mut self, record: RequestRecord, window: Duration) {
        let horizon = window * 2;
        let now = record.at;
        self.history.push_back(record);
        while let Some(front) = self.history.front() {
            if now.duration_since(front.at) > horizon {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Qualifying failures within the counting window.
    fn window_failures(&self, now: Instant, window: Duration) -> u32 {
        self.history
            .iter()
            .filter(|r| {
                !r.success
                    && r.kind.map(ErrorKind::counts_as_failure).unwrap_or(false)
                    && now.duration_since(r.at) <= window
            })
            .count() as u32
    }

    /// Forgive one failure when the tail of the history is a long run of
    /// same-kind failures. Order-sensitive heuristic, not an invariant.
    fn forgive_tail_failure(&mut self, threshold: u32) {
        let Some(last) = self.history.back() else {
            return;
        };
        if last.success {
            return;
        }
        let Some(kind) = last.kind else {
            return;
        };
        if !kind.counts_as_failure() {
            return;
        }
        let run = self
            .history
            .iter()
            .rev()
            .take_while(|r| !r.success && r.kind == Some(kind))
            .count() as u32;
        if run > threshold.max(1) / 2 {
            self.history.pop_back();
        }
    }
}

struct Shared {
    config: Arc<ServiceConfig>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<StateChange>,
}

impl Shared {
    /// Move the machine to a new state. Caller holds the lock and is
    /// responsible for announcing the returned change after releasing it.
    fn transition(&self, inner: &mut Inner, to: CircuitState) -> StateChange {
        let from = inner.state;
        inner.state = to;
        inner.state_changed_at = Instant::now();
        inner.state_changed_wall = Utc::now();
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        if to == CircuitState::Closed {
            inner.history.clear();
        }
        StateChange {
            service: self.config.name().to_string(),
            from,
            to,
            at: inner.state_changed_wall,
        }
    }

    fn announce(&self, change: &StateChange) {
        match change.to {
            CircuitState::Open => {
                tracing::warn!(
                    service = %change.service,
                    from = %change.from,
                    "circuit opened, rejecting calls"
                );
            }
            CircuitState::HalfOpen => {
                tracing::info!(
                    service = %change.service,
                    "circuit half-open, admitting probe calls"
                );
            }
            CircuitState::Closed => {
                tracing::info!(service = %change.service, "circuit closed");
            }
        }
        let _ = self.events.send(change.clone());
    }
}

/// Circuit breaker for one service.
pub struct CircuitBreaker {
    shared: Arc<Shared>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreaker {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner::new()),
                events,
            }),
            probe: Mutex::new(None),
        }
    }

    /// Run one operation under this breaker.
    ///
    /// Rejected calls fail with [`ResilienceError::CircuitOpen`] without
    /// the operation being invoked. Admitted calls have their outcome
    /// recorded and may move the state machine.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        self.admit()?;
        let started = Instant::now();
        let result = op().await;
        let elapsed = started.elapsed();
        match result {
            Ok(value) => {
                self.on_success(elapsed);
                Ok(value)
            }
            Err(error) => {
                let kind = self.shared.config.classify(&error);
                self.on_failure(elapsed, kind);
                Err(ResilienceError::Operation(error))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.shared.inner.lock().state
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.shared.events.subscribe()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.shared.inner.lock();
        BreakerMetrics {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            requests: inner.requests,
            last_failure_at: inner.last_failure_wall,
            last_success_at: inner.last_success_wall,
            state_changed_at: inner.state_changed_wall,
            half_open_calls: inner.half_open_successes,
        }
    }

    /// Counter snapshot plus windowed statistics.
    pub fn detailed_metrics(&self) -> DetailedBreakerMetrics {
        let inner = self.shared.inner.lock();
        let now = Instant::now();
        let window = self.shared.config.params().timeout;

        let mut window_requests = 0usize;
        let mut window_successes = 0usize;
        let mut times_ms: Vec<f64> = Vec::new();
        for record in &inner.history {
            if now.duration_since(record.at) <= window {
                window_requests += 1;
                if record.success {
                    window_successes += 1;
                }
                times_ms.push(record.response_time.as_secs_f64() * 1000.0);
            }
        }

        let success_rate = if window_requests == 0 {
            1.0
        } else {
            window_successes as f64 / window_requests as f64
        };
        let avg_response_ms = if times_ms.is_empty() {
            0.0
        } else {
            times_ms.iter().sum::<f64>() / times_ms.len() as f64
        };
        let p95_response_ms = percentile(&mut times_ms, 0.95);

        let error_kinds = inner
            .kind_counts
            .iter()
            .map(|(kind, count)| (kind.as_str().to_string(), *count))
            .collect();

        DetailedBreakerMetrics {
            metrics: BreakerMetrics {
                state: inner.state,
                failures: inner.failures,
                successes: inner.successes,
                requests: inner.requests,
                last_failure_at: inner.last_failure_wall,
                last_success_at: inner.last_success_wall,
                state_changed_at: inner.state_changed_wall,
                half_open_calls: inner.half_open_successes,
            },
            window_requests,
            success_rate,
            avg_response_ms,
            p95_response_ms,
            error_kinds,
            time_in_state_ms: inner.state_changed_at.elapsed().as_millis() as u64,
        }
    }

    /// Windowed success rate, 1.0 when the window is empty.
    pub fn success_rate(&self) -> f64 {
        self.detailed_metrics().success_rate
    }

    /// Force the circuit closed and zero every counter. Administrative
    /// escape hatch; idempotent.
    pub fn reset(&self) {
        let change = {
            let mut inner = self.shared.inner.lock();
            inner.history.clear();
            inner.requests = 0;
            inner.successes = 0;
            inner.failures = 0;
            inner.kind_counts.clear();
            inner.last_failure_wall = None;
            inner.last_success_wall = None;
            inner.half_open_successes = 0;
            inner.half_open_in_flight = 0;
            if inner.state != CircuitState::Closed {
                Some(self.shared.transition(&mut inner, CircuitState::Closed))
            } else {
                None
            }
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
    }

    /// Stop the background probe. Must be called before dropping inside a
    /// runtime that keeps running, to avoid a stray timer.
    pub fn destroy(&self) {
        self.stop_probe();
    }

    fn admit(&self) -> Result<(), ResilienceError> {
        let params = self.shared.config.params();
        let change = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                CircuitState::Closed => None,
                CircuitState::Open => {
                    if inner.state_changed_at.elapsed() >= params.reset_timeout {
                        let change = self.shared.transition(&mut inner, CircuitState::HalfOpen);
                        inner.half_open_in_flight = 1;
                        Some(change)
                    } else {
                        return Err(self.rejection(CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < params.half_open_max_calls {
                        inner.half_open_in_flight += 1;
                        None
                    } else {
                        // Beyond the probe budget: reject, never queue.
                        return Err(self.rejection(CircuitState::HalfOpen));
                    }
                }
            }
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
        Ok(())
    }

    fn rejection(&self, state: CircuitState) -> ResilienceError {
        tracing::debug!(
            service = %self.shared.config.name(),
            state = %state,
            "call rejected by circuit breaker"
        );
        ResilienceError::CircuitOpen {
            service: self.shared.config.name().to_string(),
            state,
        }
    }

    fn on_success(&self, elapsed: Duration) {
        let params = self.shared.config.params();
        let change = {
            let mut inner = self.shared.inner.lock();
            if inner.state == CircuitState::Closed {
                inner.forgive_tail_failure(params.failure_threshold);
            }
            inner.push_record(
                RequestRecord {
                    at: Instant::now(),
                    success: true,
                    response_time: elapsed,
                    kind: None,
                },
                params.timeout,
            );
            inner.requests += 1;
            inner.successes += 1;
            inner.last_success_wall = Some(Utc::now());

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= params.half_open_max_calls {
                    Some(self.shared.transition(&mut inner, CircuitState::Closed))
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
    }

    fn on_failure(&self, elapsed: Duration, kind: ErrorKind) {
        let params = self.shared.config.params();
        let counts = kind.counts_as_failure();
        let change = {
            let mut inner = self.shared.inner.lock();
            let now = Instant::now();
            inner.push_record(
                RequestRecord {
                    at: now,
                    success: false,
                    response_time: elapsed,
                    kind: Some(kind),
                },
                params.timeout,
            );
            inner.requests += 1;
            *inner.kind_counts.entry(kind).or_insert(0) += 1;
            if counts {
                inner.failures += 1;
                inner.last_failure_wall = Some(Utc::now());
            }

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    if counts {
                        Some(self.shared.transition(&mut inner, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::Closed if counts => {
                    if inner.window_failures(now, params.timeout) >= params.failure_threshold.max(1)
                    {
                        Some(self.shared.transition(&mut inner, CircuitState::Open))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
    }

    fn dispatch(&self, change: StateChange) {
        match change.to {
            CircuitState::Open => self.start_probe(),
            CircuitState::Closed => self.stop_probe(),
            CircuitState::HalfOpen => {}
        }
        self.shared.announce(&change);
    }

    /// Spawn the open-state health probe. It exits on its own as soon as
    /// the circuit leaves the open state.
    fn start_probe(&self) {
        let shared = Arc::clone(&self.shared);
        let reset_timeout = shared.config.params().reset_timeout;
        let interval = (reset_timeout / 4)
            .min(MAX_PROBE_INTERVAL)
            .max(Duration::from_millis(100));

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (still_open, due) = {
                    let inner = shared.inner.lock();
                    (
                        inner.state == CircuitState::Open,
                        inner.state_changed_at.elapsed() >= reset_timeout,
                    )
                };
                if !still_open {
                    break;
                }
                if !due {
                    continue;
                }
                if shared.config.health_check().check().await {
                    let change = {
                        let mut inner = shared.inner.lock();
                        if inner.state == CircuitState::Open {
                            Some(shared.transition(&mut inner, CircuitState::HalfOpen))
                        } else {
                            None
                        }
                    };
                    if let Some(change) = change {
                        shared.announce(&change);
                    }
                    break;
                }
                tracing::debug!(
                    service = %shared.config.name(),
                    "health probe failed, circuit stays open"
                );
            }
        });

        if let Some(previous) = self.probe.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_probe(&self) {
        if let Some(handle) = self.probe.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        self.stop_probe();
    }
}

fn percentile(samples: &mut [f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((samples.len() as f64) * p).ceil() as usize;
    samples[rank.clamp(1, samples.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use breakwater_core::{FnHealthCheck, ServiceParams};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, window: Duration, reset: Duration, half_open: u32) -> Arc<ServiceConfig> {
        let params = ServiceParams {
            failure_threshold: threshold,
            timeout: window,
            reset_timeout: reset,
            half_open_max_calls: half_open,
            ..ServiceParams::default()
        };
        Arc::new(ServiceConfig::new("TEST", params))
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(config(
            threshold,
            Duration::from_secs(10),
            Duration::from_secs(30),
            2,
        ))
    }

    async fn fail_retryable(cb: &CircuitBreaker) {
        let _ = cb
            .execute(|| async { Err::<(), _>(OpError::new("boom").with_status(500)) })
            .await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        cb.execute(|| async { Ok::<_, OpError>(1u32) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let cb = breaker(3);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().requests, 0);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = breaker(3);
        fail_retryable(&cb).await;
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().failures, 3);
    }

    #[tokio::test]
    async fn test_zero_threshold_opens_on_first_failure() {
        let cb = breaker(0);
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_non_retryable_never_opens() {
        let cb = breaker(2);
        for _ in 0..10 {
            let _ = cb
                .execute(|| async { Err::<(), _>(OpError::new("gone").with_status(404)) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        let metrics = cb.metrics();
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.requests, 10);
        // Still visible in the per-kind breakdown.
        let detailed = cb.detailed_metrics();
        assert_eq!(detailed.error_kinds.get("NOT_FOUND"), Some(&10));
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let cb = breaker(1);
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OpError>(1u32)
            })
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::CircuitOpen { state: CircuitState::Open, .. })
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_after_reset_timeout() {
        let cb = CircuitBreaker::new(config(
            1,
            Duration::from_secs(10),
            Duration::from_secs(30),
            1,
        ));
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        cb.destroy(); // keep the probe out of this test

        tokio::time::advance(Duration::from_secs(31)).await;

        let invoked = AtomicU32::new(0);
        cb.execute(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OpError>(1u32)
        })
        .await
        .unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        // half_open_max_calls = 1, so one success closes the circuit.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(config(
            1,
            Duration::from_secs(10),
            Duration::from_secs(5),
            2,
        ));
        fail_retryable(&cb).await;
        cb.destroy();
        tokio::time::advance(Duration::from_secs(6)).await;

        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_budget_closes() {
        let cb = CircuitBreaker::new(config(
            1,
            Duration::from_secs(10),
            Duration::from_secs(5),
            2,
        ));
        fail_retryable(&cb).await;
        cb.destroy();
        tokio::time::advance(Duration::from_secs(6)).await;

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admission_beyond_budget_rejected() {
        let cb = Arc::new(CircuitBreaker::new(config(
            1,
            Duration::from_secs(10),
            Duration::from_secs(5),
            1,
        )));
        fail_retryable(&cb).await;
        cb.destroy();
        tokio::time::advance(Duration::from_secs(6)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|| async {
                    let _ = release_rx.await;
                    Ok::<_, OpError>(1u32)
                })
                .await
        });
        // Let the probe call get admitted.
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let second = cb.execute(|| async { Ok::<_, OpError>(2u32) }).await;
        assert!(matches!(
            second,
            Err(ResilienceError::CircuitOpen { state: CircuitState::HalfOpen, .. })
        ));

        release_tx.send(()).ok();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let cb = CircuitBreaker::new(config(
            2,
            Duration::from_secs(10),
            Duration::from_secs(30),
            1,
        ));
        fail_retryable(&cb).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        fail_retryable(&cb).await;
        // Two failures total, but never two inside one window.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_forgives_one_tail_failure() {
        let cb = breaker(3);
        fail_retryable(&cb).await;
        fail_retryable(&cb).await;
        // Tail run of 2 exceeds threshold/2, so this success drops one.
        succeed(&cb).await;
        fail_retryable(&cb).await;
        // Window now holds 2 qualifying failures, below the threshold.
        assert_eq!(cb.state(), CircuitState::Closed);
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let cb = breaker(1);
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let first = cb.metrics();
        cb.reset();
        let second = cb.metrics();

        for snapshot in [first, second] {
            assert_eq!(snapshot.state, CircuitState::Closed);
            assert_eq!(snapshot.requests, 0);
            assert_eq!(snapshot.failures, 0);
            assert_eq!(snapshot.successes, 0);
            assert_eq!(snapshot.half_open_calls, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_moves_open_to_half_open_early() {
        let params = ServiceParams {
            failure_threshold: 1,
            timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(4),
            half_open_max_calls: 1,
            ..ServiceParams::default()
        };
        let config = Arc::new(
            ServiceConfig::new("TEST", params)
                .with_health_check(FnHealthCheck(|| async { true })),
        );
        let cb = CircuitBreaker::new(config);
        fail_retryable(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Probe interval is reset/4 = 1s; the probe fires once the reset
        // timeout has elapsed and the health check passes.
        tokio::time::sleep(Duration::from_secs(5)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.destroy();
    }

    #[tokio::test]
    async fn test_state_change_events() {
        let cb = breaker(1);
        let mut events = cb.subscribe();
        fail_retryable(&cb).await;

        let change = events.try_recv().unwrap();
        assert_eq!(change.from, CircuitState::Closed);
        assert_eq!(change.to, CircuitState::Open);
        assert_eq!(change.service, "TEST");
        cb.destroy();
    }

    #[tokio::test]
    async fn test_invariants_hold() {
        let cb = breaker(50);
        for i in 0..20u32 {
            if i % 3 == 0 {
                fail_retryable(&cb).await;
            } else {
                succeed(&cb).await;
            }
            let m = cb.metrics();
            assert!(m.failures <= m.requests);
            assert!(m.successes <= m.requests);
        }
    }
}
