//! Retry classification, backoff timing, and rate limit windows.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests are allowed to panic on failures

use std::sync::Arc;
use std::time::Duration;
use taskpilot_resilience::{
    Admission, CallError, CircuitBreakerRegistry, CircuitState, Dependency, RateLimiter,
    RateLimiterConfig, ResilientClient, RetryError, RetryPolicy,
    retry::retry_with_backoff,
};
use taskpilot_testing::{ScriptedOperation, SimulatedHttpError, init_tracing};
use tokio::time::Instant;

fn policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .base_delay(Duration::from_secs(1))
        .max_delay(Duration::from_secs(60))
        .build()
}

#[tokio::test(start_paused = true)]
async fn persistent_500_exhausts_after_three_attempts() {
    init_tracing();
    let op = ScriptedOperation::<(), _>::always(Err(SimulatedHttpError::Status(500)));

    let result = retry_with_backoff(&policy(), "analyze", || op.call()).await;

    assert_eq!(op.calls(), 3);
    match result {
        Err(RetryError::Exhausted { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, SimulatedHttpError::Status(500));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn not_found_aborts_after_first_attempt() {
    let op = ScriptedOperation::<(), _>::always(Err(SimulatedHttpError::Status(404)));
    let started = Instant::now();

    let result = retry_with_backoff(&policy(), "analyze", || op.call()).await;

    assert_eq!(op.calls(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(matches!(result, Err(RetryError::NonRetryable { attempt: 1, .. })));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_and_unavailable_are_retried_to_the_limit() {
    for status in [429, 503] {
        let op = ScriptedOperation::<(), _>::always(Err(SimulatedHttpError::Status(status)));
        let result = retry_with_backoff(&policy(), "analyze", || op.call()).await;

        assert_eq!(op.calls(), 3, "status {status}");
        assert_eq!(result.unwrap_err().attempts(), 3);
    }
}

#[tokio::test(start_paused = true)]
async fn waits_double_between_attempts() {
    let policy = RetryPolicy::builder()
        .max_attempts(5)
        .base_delay(Duration::from_millis(250))
        .max_delay(Duration::from_secs(60))
        .build();
    let op = ScriptedOperation::<(), _>::always(Err(SimulatedHttpError::Timeout));

    let _ = retry_with_backoff(&policy, "analyze", || op.call()).await;

    let expected: Vec<_> = (1..5).map(|i| policy.backoff_for(i)).collect();
    assert_eq!(op.gaps(), expected);
    assert_eq!(
        expected,
        vec![
            Duration::from_millis(500),
            Duration::from_millis(1_000),
            Duration::from_millis(2_000),
            Duration::from_millis(4_000),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn eleventh_request_in_window_is_denied() {
    let limiter = RateLimiter::new("gemini_api", RateLimiterConfig::new(10, Duration::from_secs(60)));

    for _ in 0..10 {
        assert!(limiter.acquire(Some("scenario")));
    }
    assert!(!limiter.acquire(Some("scenario")));
    assert_eq!(limiter.status().available_slots, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(limiter.acquire(Some("scenario")));
    assert_eq!(limiter.status().current_count, 1);
}

#[tokio::test(start_paused = true)]
async fn llm_defaults_compose_end_to_end() {
    let registry = CircuitBreakerRegistry::new();
    let limit = Dependency::LlmAnalysis.default_rate_limit().unwrap();
    let limiter = Arc::new(RateLimiter::new(Dependency::LlmAnalysis.name(), limit));
    let client = ResilientClient::new(registry.for_dependency(Dependency::LlmAnalysis), policy())
        .with_rate_limiter(Arc::clone(&limiter), Admission::FailFast);

    // Three logical calls, each retried three times, open the LLM breaker.
    let op = ScriptedOperation::<(), _>::always(Err(SimulatedHttpError::Status(500)));
    for _ in 0..3 {
        let result = client.execute("analyze", Some("test"), || op.call()).await;
        assert!(matches!(result, Err(CallError::Retry(RetryError::Exhausted { .. }))));
    }
    assert_eq!(op.calls(), 9);

    let breaker = registry.get("gemini_api").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    let result = client.execute("analyze", Some("test"), || op.call()).await;
    assert!(matches!(result, Err(CallError::CircuitOpen(_))));
    assert_eq!(op.calls(), 9);
    assert_eq!(limiter.status().current_count, 4);
}

#[tokio::test(start_paused = true)]
async fn uncounted_failures_never_open_the_circuit() {
    let registry = CircuitBreakerRegistry::new();
    let client = ResilientClient::new(registry.for_dependency(Dependency::Mail), policy());
    let op = ScriptedOperation::<(), _>::always(Err(SimulatedHttpError::Invalid(
        "missing credentials".into(),
    )));

    for _ in 0..10 {
        let result = client.execute("send", None, || op.call()).await;
        assert!(matches!(result, Err(CallError::Retry(RetryError::NonRetryable { .. }))));
    }

    let stats = client.breaker().stats();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.total_failures, 10);
}
