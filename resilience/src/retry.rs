//! Retry with exponential backoff for transient failures of external calls.
//!
//! Errors decide for themselves whether another attempt makes sense through
//! the [`Retryable`] trait. Timeouts, 5xx responses and 429 rate limiting are
//! retried; other 4xx responses abort immediately.
//!
//! The whole loop is meant to run as one operation inside
//! [`CircuitBreaker::call_classified`](crate::circuit_breaker::CircuitBreaker::call_classified),
//! so a call that needed three attempts counts once against the breaker.
//!
//! # Example
//!
//! ```rust
//! use taskpilot_resilience::retry::{RetryPolicy, Retryable, retry_with_backoff};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct Flaky;
//!
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         f.write_str("flaky")
//!     }
//! }
//!
//! impl Retryable for Flaky {
//!     fn is_retryable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! let value = retry_with_backoff(&policy, "example", || async { Ok::<_, Flaky>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Classification of an error for retry and breaker purposes.
pub trait Retryable {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;

    /// Whether the final failure says something about dependency health.
    ///
    /// Errors caused by our own side (missing credentials, unparseable
    /// responses) return `false` so they do not trip the circuit.
    fn counts_against_breaker(&self) -> bool {
        true
    }
}

/// Retry rule for HTTP status codes.
///
/// 429 and every 5xx (including 503) are retryable. Any other 4xx is not,
/// and neither is a status outside the error ranges.
#[must_use]
pub const fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500..=599)
}

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 60 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff base; the wait before attempt `i` is `base_delay * 2^i`
    pub base_delay: Duration,
    /// Cap for any single wait
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            base_delay: None,
            max_delay: None,
        }
    }

    /// Wait before attempt `attempt` (0-indexed): `base_delay * 2^attempt`,
    /// capped at `max_delay`.
    ///
    /// Attempt 0 is never preceded by a wait, so the retry loop first uses
    /// `backoff_for(1)`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the backoff base.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`]. At least one attempt is always made.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
        }
    }
}

/// Terminal failure of the retry loop.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    #[error("operation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: E,
    },
    /// An attempt failed with an error that must not be retried
    #[error("operation failed with a non-retryable error on attempt {attempt}: {error}")]
    NonRetryable {
        /// 1-based attempt that failed
        attempt: u32,
        /// The error
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::NonRetryable { attempt, .. } => *attempt,
        }
    }

    /// The last underlying error.
    #[must_use]
    pub const fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }

    /// Unwrap into the last underlying error.
    pub fn into_last_error(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Runs `operation` up to `policy.max_attempts` times. Before attempt `i > 0`
/// it sleeps [`RetryPolicy::backoff_for(i)`](RetryPolicy::backoff_for).
/// A non-retryable error ends the loop immediately.
///
/// # Errors
///
/// - [`RetryError::NonRetryable`] on the first error with `is_retryable() == false`
/// - [`RetryError::Exhausted`] with the last error once every attempt failed
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = policy.backoff_for(attempt);
            tracing::warn!(
                operation = operation_name,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying operation"
            );
            RetryMetrics::record_attempt(operation_name);
            sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %error,
                    "Error is not retryable, failing immediately"
                );
                return Err(RetryError::NonRetryable {
                    attempt: attempt + 1,
                    error,
                });
            }
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %error,
                        "Operation failed after max attempts"
                    );
                    RetryMetrics::record_exhausted(operation_name);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    error = %error,
                    "Operation attempt failed"
                );
            }
        }
    }
}
