//! Token-bucket admission control per service.
//!
//! Tokens refill lazily from elapsed time on every access, whole tokens
//! at a time, up to the bucket's capacity. Callers that find the bucket
//! empty are queued in arrival order and woken by a background drain
//! tick; a queued caller that has waited longer than the fairness bound
//! is rejected rather than granted a stale token.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use breakwater_core::{RateLimiterParams, ResilienceError};

/// How often the drain tick wakes queued callers.
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Longest a caller may sit in the admission queue.
const MAX_QUEUE_WAIT: Duration = Duration::from_secs(30);

struct Waiter {
    tx: oneshot::Sender<Result<(), ResilienceError>>,
    enqueued_at: Instant,
}

struct Inner {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl Inner {
    /// Add whole tokens earned since the last refill. Fractions below one
    /// token stay banked in elapsed time until they round up.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let earned = (elapsed * self.refill_rate).floor();
        if earned >= 1.0 {
            self.tokens = (self.tokens + earned).min(self.max_tokens);
            self.last_refill = now;
        }
    }
}

/// Exported view of one limiter's state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub queued: usize,
}

struct Shared {
    service: String,
    inner: Mutex<Inner>,
}

impl Shared {
    /// Expire stale waiters, then hand freed tokens to the oldest
    /// remaining ones in arrival order.
    fn drain(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.refill(now);

        while inner
            .waiters
            .front()
            .map_or(false, |w| now.duration_since(w.enqueued_at) > MAX_QUEUE_WAIT)
        {
            if let Some(waiter) = inner.waiters.pop_front() {
                let waited = now.duration_since(waiter.enqueued_at);
                tracing::warn!(
                    service = %self.service,
                    waited_ms = waited.as_millis() as u64,
                    "queued call expired before a token freed up"
                );
                let _ = waiter.tx.send(Err(ResilienceError::RateLimitExpired {
                    service: self.service.clone(),
                    waited,
                }));
            }
        }

        while inner.tokens >= 1.0 {
            let Some(waiter) = inner.waiters.pop_front() else {
                break;
            };
            // A waiter whose caller has gone away gives its token back.
            if waiter.tx.send(Ok(())).is_ok() {
                inner.tokens -= 1.0;
            }
        }
    }
}

/// Token-bucket rate limiter for one service.
pub struct RateLimiter {
    shared: Arc<Shared>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter and start its drain tick. Must be called from
    /// within a tokio runtime.
    pub fn new(service: impl Into<String>, params: &RateLimiterParams) -> Self {
        let shared = Arc::new(Shared {
            service: service.into(),
            inner: Mutex::new(Inner {
                tokens: params.max_tokens as f64,
                max_tokens: params.max_tokens as f64,
                refill_rate: params.refill_rate,
                last_refill: Instant::now(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        });

        let drain_shared = Arc::clone(&shared);
        let drain_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(DRAIN_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if drain_shared.inner.lock().closed {
                    break;
                }
                drain_shared.drain();
            }
        });

        Self {
            shared,
            drain_task: Mutex::new(Some(drain_task)),
        }
    }

    /// Acquire one admission token.
    ///
    /// Resolves immediately when a token is available; otherwise the
    /// caller is queued FIFO and suspended until the drain tick frees a
    /// token, the fairness bound expires, or the limiter shuts down.
    pub async fn acquire(&self) -> Result<(), ResilienceError> {
        let rx = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(ResilienceError::RateLimiterClosed {
                    service: self.shared.service.clone(),
                });
            }
            inner.refill(Instant::now());
            if inner.tokens >= 1.0 {
                inner.tokens -= 1.0;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter {
                tx,
                enqueued_at: Instant::now(),
            });
            tracing::debug!(
                service = %self.shared.service,
                queued = inner.waiters.len(),
                "bucket empty, caller queued"
            );
            rx
        };

        match rx.await {
            Ok(result) => result,
            // Sender dropped without an answer: the limiter is gone.
            Err(_) => Err(ResilienceError::RateLimiterClosed {
                service: self.shared.service.clone(),
            }),
        }
    }

    /// Tokens currently available.
    pub fn available_tokens(&self) -> f64 {
        let mut inner = self.shared.inner.lock();
        inner.refill(Instant::now());
        inner.tokens
    }

    /// Callers currently queued for admission.
    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().waiters.len()
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut inner = self.shared.inner.lock();
        inner.refill(Instant::now());
        RateLimiterSnapshot {
            tokens: inner.tokens,
            max_tokens: inner.max_tokens,
            refill_rate: inner.refill_rate,
            queued: inner.waiters.len(),
        }
    }

    /// Stop the drain tick and reject every queued caller.
    pub fn destroy(&self) {
        if let Some(task) = self.drain_task.lock().take() {
            task.abort();
        }
        let waiters = {
            let mut inner = self.shared.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(ResilienceError::RateLimiterClosed {
                service: self.shared.service.clone(),
            }));
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.destroy();
    }
}
