//! End-to-end scenarios driving the full resilience stack through the
//! orchestrator, with configuration loaded the way an embedder would
//! load it: a YAML parameter table plus programmatic classifier and
//! fallback attachments.

use anyhow::Result;
use breakwater_core::{
    BoxFuture, CallContext, DegradationStrategy, FallbackMethod, OpError, ParamsTable,
    RecoveryCriteria, ServiceConfig, ServiceConfigRegistry,
};
use breakwater_runtime::{HealthLevel, ResilienceOrchestrator};
use breakwater_core::ResilienceError;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const TABLE: &str = r#"
services:
  flights:
    failure_threshold: 3
    timeout: 10s
    reset_timeout: 30s
    half_open_max_calls: 2
    retry:
      max_retries: 1
      base_delay: 50ms
      max_delay: 1s
      backoff_multiplier: 2.0
      jitter_factor: 0.0
    rate_limiter:
      max_tokens: 50
      refill_rate: 25.0
  quotes:
    failure_threshold: 20
    timeout: 10s
    reset_timeout: 30s
    half_open_max_calls: 2
    retry:
      max_retries: 3
      base_delay: 100ms
      max_delay: 5s
      backoff_multiplier: 2.0
      jitter_factor: 0.0
    rate_limiter:
      max_tokens: 5
      refill_rate: 1.0
"#;

fn registry() -> Result<Arc<ServiceConfigRegistry>> {
    // Engine logs show up under RUST_LOG=breakwater_runtime=debug.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let table = ParamsTable::from_yaml(TABLE)?;
    Ok(Arc::new(
        ServiceConfigRegistry::builder().params_table(table).build()?,
    ))
}

fn transient() -> OpError {
    OpError::new("upstream unavailable").with_status(503)
}

/// Scenario A: three consecutive retryable failures open the circuit and
/// the next call is rejected without the operation running.
#[tokio::test]
async fn breaker_opens_and_fails_fast() -> Result<()> {
    let engine = ResilienceOrchestrator::new(registry()?);
    let invocations = AtomicU32::new(0);

    for _ in 0..3 {
        let result: Result<u32, _> = engine
            .execute_with_resilience(
                "FLIGHTS",
                "search",
                || {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async { Err(transient()) }
                },
                None,
            )
            .await;
        assert!(result.is_err());
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let fourth: Result<u32, _> = engine
        .execute_with_resilience(
            "FLIGHTS",
            "search",
            || {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Ok(1u32) }
            },
            None,
        )
        .await;
    assert!(matches!(fourth, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let status = engine.health_status();
    assert_eq!(
        status.services.get("FLIGHTS").map(|s| s.level),
        Some(HealthLevel::Unhealthy)
    );
    engine.shutdown();
    Ok(())
}

/// Scenario B: a burst within bucket capacity is admitted instantly; the
/// next caller waits roughly one refill period.
#[tokio::test(start_paused = true)]
async fn sixth_call_waits_for_token_refill() -> Result<()> {
    let engine = Arc::new(ResilienceOrchestrator::new(registry()?));

    let burst_start = Instant::now();
    for _ in 0..5 {
        let value: u32 = engine
            .execute_with_resilience("QUOTES", "latest", || async { Ok(9u32) }, None)
            .await?;
        assert_eq!(value, 9);
    }
    assert_eq!(burst_start.elapsed(), Duration::ZERO);

    let waited_start = Instant::now();
    let value: u32 = engine
        .execute_with_resilience("QUOTES", "latest", || async { Ok(10u32) }, None)
        .await?;
    assert_eq!(value, 10);
    let waited = waited_start.elapsed();
    assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(1300), "waited {waited:?}");
    engine.shutdown();
    Ok(())
}

/// Scenario C: an always-failing retryable operation runs exactly
/// `max_retries` times and the original error is rethrown.
#[tokio::test(start_paused = true)]
async fn retries_exhaust_and_rethrow_original_error() -> Result<()> {
    let engine = ResilienceOrchestrator::new(registry()?);
    let invocations = AtomicU32::new(0);

    let result: Result<u32, _> = engine
        .execute_with_resilience(
            "QUOTES",
            "latest",
            || {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::new("still down").with_status(500)) }
            },
            None,
        )
        .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    match result {
        Err(ResilienceError::Operation(inner)) => {
            assert_eq!(inner.message, "still down");
            assert_eq!(inner.status, Some(500));
        }
        other => panic!("expected the original operation error, got {other:?}"),
    }

    let metrics = engine.comprehensive_metrics();
    let op = metrics.operations.get("QUOTES:latest").unwrap();
    assert_eq!(op.retry_count, 2);
    assert_eq!(op.consecutive_failures, 1);
    engine.shutdown();
    Ok(())
}

/// A terminal domain error short-circuits the retry loop and reaches the
/// caller with its original message.
#[tokio::test]
async fn non_retryable_error_passes_through_unchanged() -> Result<()> {
    let engine = ResilienceOrchestrator::new(registry()?);
    let invocations = AtomicU32::new(0);

    let result: Result<u32, _> = engine
        .execute_with_resilience(
            "QUOTES",
            "latest",
            || {
                invocations.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(OpError::new("quote id not found")
                        .with_code("quote_missing")
                        .with_status(404))
                }
            },
            None,
        )
        .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    match result {
        Err(ResilienceError::Operation(inner)) => {
            assert_eq!(inner.message, "quote id not found");
        }
        other => panic!("expected pass-through, got {other:?}"),
    }

    // Terminal failures never open the breaker.
    let detailed = engine.detailed_metrics("QUOTES").unwrap();
    assert_eq!(detailed.metrics.failures, 0);
    engine.shutdown();
    Ok(())
}

/// A degraded service answers from its fallback chain, in priority
/// order, skipping entries whose own health check fails.
#[tokio::test]
async fn fallback_chain_answers_for_degraded_service() -> Result<()> {
    let table = ParamsTable::from_yaml(TABLE)?;
    let flights = table.services.get("FLIGHTS").cloned().unwrap();

    let secondary_hits = Arc::new(AtomicU32::new(0));
    let hits = Arc::clone(&secondary_hits);

    let strategy = DegradationStrategy::new(
        vec![
            FallbackMethod::new("mirror", 1, |_ctx: CallContext| {
                Box::pin(async { Err(OpError::new("mirror down")) }) as BoxFuture<_>
            }),
            FallbackMethod::new("cached-route", 2, move |_ctx: CallContext| {
                let hits = Arc::clone(&hits);
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"route": "LHR-JFK", "stale": true}))
                }) as BoxFuture<_>
            }),
        ],
        RecoveryCriteria::default(),
    );

    let registry = Arc::new(
        ServiceConfigRegistry::builder()
            .service(ServiceConfig::new("FLIGHTS", flights).with_degradation(strategy))
            .build()?,
    );
    let engine = ResilienceOrchestrator::new(registry);

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Route {
        route: String,
        stale: bool,
    }

    let route: Route = engine
        .execute_with_resilience("FLIGHTS", "search", || async { Err(transient()) }, None)
        .await?;
    assert_eq!(route.route, "LHR-JFK");
    assert!(route.stale);
    assert_eq!(secondary_hits.load(Ordering::SeqCst), 1);

    let metrics = engine.comprehensive_metrics();
    assert_eq!(metrics.operations.get("FLIGHTS:search").unwrap().fallback_uses, 1);
    let degradation = metrics.degradation.get("FLIGHTS").unwrap();
    assert!(!degradation.healthy);
    assert_eq!(degradation.deepest_fallback_priority, Some(2));
    engine.shutdown();
    Ok(())
}

/// After the reset timeout, the breaker admits probes again and a run of
/// successes closes it.
#[tokio::test(start_paused = true)]
async fn breaker_recovers_through_half_open() -> Result<()> {
    let engine = ResilienceOrchestrator::new(registry()?);

    for _ in 0..3 {
        let _: Result<u32, _> = engine
            .execute_with_resilience("FLIGHTS", "search", || async { Err(transient()) }, None)
            .await;
    }
    assert_eq!(
        engine.health_status().services.get("FLIGHTS").map(|s| s.level),
        Some(HealthLevel::Unhealthy)
    );

    tokio::time::advance(Duration::from_secs(31)).await;

    // half_open_max_calls = 2: two successful probes close the circuit.
    for _ in 0..2 {
        let value: u32 = engine
            .execute_with_resilience("FLIGHTS", "search", || async { Ok(3u32) }, None)
            .await?;
        assert_eq!(value, 3);
    }

    let detailed = engine.detailed_metrics("FLIGHTS").unwrap();
    assert_eq!(
        detailed.metrics.state,
        breakwater_core::CircuitState::Closed
    );
    engine.shutdown();
    Ok(())
}
