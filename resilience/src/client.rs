//! Composition of rate limiting, circuit breaking and retry around one
//! external call.
//!
//! ```text
//! execute()
//!   │
//!   ├─ rate limiter gate ──────── denied ──> CallError::RateLimited
//!   │
//!   └─ breaker.call_classified( ─ open ────> CallError::CircuitOpen
//!        retry loop ──────────── deadline ─> CallError::Timeout
//!          attempt, backoff, attempt, ...
//!      ) ─────────────────────── failed ───> CallError::Retry
//! ```
//!
//! The breaker sees one outcome per `execute`, no matter how many attempts
//! the retry loop made.

use crate::circuit_breaker::{
    CircuitBreaker, CircuitError, CircuitOpenError, CircuitTimeoutError, Failure,
};
use crate::metrics::ExternalApiMetrics;
use crate::rate_limiter::{RateLimitExceeded, RateLimiter};
use crate::retry::{RetryError, RetryPolicy, Retryable, retry_with_backoff};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// How a call waits for a rate limit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Fail immediately when the window is full.
    FailFast,
    /// Poll for a slot for up to the given duration.
    Wait(Duration),
}

/// Failure of a resilient call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// No rate limit slot was available
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    /// The circuit is open; the operation was not invoked
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    /// The call (all attempts together) exceeded the breaker's call timeout
    #[error(transparent)]
    Timeout(#[from] CircuitTimeoutError),
    /// The operation failed after retrying
    #[error("{0}")]
    Retry(RetryError<E>),
}

impl<E> CallError<E> {
    /// Whether the call was refused before reaching the dependency.
    ///
    /// Callers typically degrade to a fallback in this case.
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::CircuitOpen(_))
    }

    /// The operation's last error, if it ran and failed.
    #[must_use]
    pub const fn last_error(&self) -> Option<&E> {
        match self {
            Self::Retry(err) => Some(err.last_error()),
            Self::RateLimited(_) | Self::CircuitOpen(_) | Self::Timeout(_) => None,
        }
    }
}

/// Runs operations against one dependency with the full resilience stack.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    limiter: Option<(Arc<RateLimiter>, Admission)>,
}

impl ResilientClient {
    /// Client guarded by `breaker`, retrying per `retry`, without rate limiting.
    #[must_use]
    pub const fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            breaker,
            retry,
            limiter: None,
        }
    }

    /// Gate every call on `limiter`.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>, admission: Admission) -> Self {
        self.limiter = Some((limiter, admission));
        self
    }

    /// The breaker guarding this client.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The rate limiter, if any.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref().map(|(limiter, _)| limiter)
    }

    /// The retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute `operation` through the rate limiter, breaker and retry loop.
    ///
    /// A final error whose [`Retryable::counts_against_breaker`] is `false` is
    /// reported to the breaker as uncounted.
    ///
    /// # Errors
    ///
    /// - [`CallError::RateLimited`] if no slot could be obtained
    /// - [`CallError::CircuitOpen`] if the breaker rejected the call
    /// - [`CallError::Timeout`] if the whole call exceeded the breaker's call timeout
    /// - [`CallError::Retry`] if the operation failed after retrying
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation_name: &str,
        caller: Option<&str>,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let started = Instant::now();
        let result = self.execute_inner(operation_name, caller, operation).await;
        ExternalApiMetrics::record_duration(self.breaker.name(), operation_name, started.elapsed());
        result
    }

    async fn execute_inner<F, Fut, T, E>(
        &self,
        operation_name: &str,
        caller: Option<&str>,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.admit(caller).await?;

        let retry = &self.retry;
        self.breaker
            .call_classified(|| async move {
                retry_with_backoff(retry, operation_name, operation)
                    .await
                    .map_err(|err| {
                        if err.last_error().counts_against_breaker() {
                            Failure::Counted(err)
                        } else {
                            Failure::Uncounted(err)
                        }
                    })
            })
            .await
            .map_err(|err| match err {
                CircuitError::Open(err) => CallError::CircuitOpen(err),
                CircuitError::Timeout(err) => CallError::Timeout(err),
                CircuitError::Failed(err) | CircuitError::Uncounted(err) => CallError::Retry(err),
            })
    }

    async fn admit(&self, caller: Option<&str>) -> Result<(), RateLimitExceeded> {
        match &self.limiter {
            None => Ok(()),
            Some((limiter, Admission::FailFast)) => limiter.acquire_or_err(caller),
            Some((limiter, Admission::Wait(max_wait))) => {
                if limiter.wait_for_slot(caller, *max_wait).await {
                    Ok(())
                } else {
                    Err(limiter.exceeded())
                }
            }
        }
    }
}
