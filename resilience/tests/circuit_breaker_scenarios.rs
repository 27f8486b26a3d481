//! End-to-end circuit breaker and registry behavior.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests are allowed to panic on failures

use std::sync::Arc;
use std::time::Duration;
use taskpilot_resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitState, Dependency,
};
use taskpilot_testing::{ScriptedOperation, SimulatedHttpError, init_tracing};
use tokio::sync::Barrier;

fn scenario_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig::builder()
        .failure_threshold(3)
        .recovery_timeout(Duration::from_secs(5))
        .call_timeout(Duration::from_secs(1))
        .success_threshold(2)
        .build()
}

#[tokio::test(start_paused = true)]
async fn open_cooldown_probe_and_close() {
    init_tracing();
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.get_or_create("calendar_api", Some(scenario_config()));

    let failing = ScriptedOperation::<(), _>::always(Err(SimulatedHttpError::Status(500)));
    for _ in 0..3 {
        let result = breaker.call(|| failing.call()).await;
        assert!(matches!(result, Err(CircuitError::Failed(SimulatedHttpError::Status(500)))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // 2s into the cooldown: rejected, operation untouched.
    tokio::time::advance(Duration::from_secs(2)).await;
    let healthy = ScriptedOperation::<_, SimulatedHttpError>::always(Ok("pong"));
    match breaker.call(|| healthy.call()).await {
        Err(CircuitError::Open(err)) => {
            assert_eq!(err.circuit, "calendar_api");
            assert_eq!(err.state, CircuitState::Open);
            assert_eq!(err.failure_count, 3);
            assert_eq!(err.retry_after, Duration::from_secs(3));
        }
        other => panic!("expected circuit open, got {other:?}"),
    }
    assert_eq!(healthy.calls(), 0);

    // 6s after the last failure the next call probes.
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(breaker.call(|| healthy.call()).await.unwrap(), "pong");
    assert_eq!(healthy.calls(), 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    assert_eq!(breaker.call(|| healthy.call()).await.unwrap(), "pong");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);

    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 5);
    assert_eq!(stats.total_successes, 2);
    assert_eq!(stats.total_failures, 3);
    assert_eq!(stats.total_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_operation_is_cancelled_at_call_timeout() {
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.get_or_create("slow", Some(scenario_config()));
    let slow = ScriptedOperation::<_, SimulatedHttpError>::always(Ok(()))
        .with_latency(Duration::from_secs(10));

    let started = tokio::time::Instant::now();
    let result = breaker.call(|| slow.call()).await;

    match result {
        Err(CircuitError::Timeout(err)) => {
            assert_eq!(err.circuit, "slow");
            assert_eq!(err.timeout, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert_eq!(breaker.failure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stats_serialize_for_status_endpoint() {
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.for_dependency(Dependency::LlmAnalysis);
    breaker.call(|| async { Ok::<_, SimulatedHttpError>(()) }).await.unwrap();

    let json = serde_json::to_value(registry.snapshot()).unwrap();
    let entry = &json[0];
    assert_eq!(entry["name"], "gemini_api");
    assert_eq!(entry["state"], "closed");
    assert_eq!(entry["total_calls"], 1);
    assert_eq!(entry["config"]["failure_threshold"], 3);
    assert_eq!(entry["config"]["recovery_timeout_secs"], 30.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_first_access_yields_one_breaker() {
    let registry = Arc::new(CircuitBreakerRegistry::new());
    let barrier = Arc::new(Barrier::new(64));

    let handles: Vec<_> = (0..64_u32)
        .map(|i| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let config = CircuitBreakerConfig::builder()
                    .failure_threshold(i + 1)
                    .build();
                registry.get_or_create("shared", Some(config))
            })
        })
        .collect();

    let mut breakers = Vec::new();
    for handle in handles {
        breakers.push(handle.await.unwrap());
    }

    assert_eq!(registry.len(), 1);
    let first = &breakers[0];
    assert!(breakers.iter().all(|b| Arc::ptr_eq(b, first)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_outcomes_are_not_lost() {
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.get_or_create(
        "busy",
        Some(
            CircuitBreakerConfig::builder()
                .failure_threshold(10_000)
                .build(),
        ),
    );

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                let _ = breaker
                    .call(|| async move {
                        tokio::task::yield_now().await;
                        if i % 3 == 0 {
                            Err(SimulatedHttpError::Status(502))
                        } else {
                            Ok(())
                        }
                    })
                    .await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 200);
    assert_eq!(stats.total_failures, 67);
    assert_eq!(stats.total_successes, 133);
}
