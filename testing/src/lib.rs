//! # Taskpilot Testing
//!
//! Testing utilities for the resilience layer and its clients.
//!
//! This crate provides:
//! - A fixed clock for deterministic schedule computation
//! - Scripted fallible operations that count and timestamp invocations
//! - Simulated HTTP failures classified like real ones
//! - One-line tracing setup for tests
//!
//! ## Example
//!
//! ```
//! use taskpilot_testing::{ScriptedOperation, SimulatedHttpError};
//!
//! # async fn example() {
//! let op = ScriptedOperation::new(vec![Err(SimulatedHttpError::Status(503))], Ok(42));
//! assert!(op.call().await.is_err());
//! assert_eq!(op.call().await, Ok(42));
//! assert_eq!(op.calls(), 2);
//! # }
//! ```

use chrono::{DateTime, Utc};
use taskpilot_resilience::clock::Clock;

/// Mock implementations of injected dependencies.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use taskpilot_testing::mocks::FixedClock;
    /// use taskpilot_resilience::clock::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Scripted operations standing in for external calls.
pub mod operations {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use tokio::time::Instant;

    /// An operation that plays back a fixed sequence of results.
    ///
    /// Scripted results are returned in order; once exhausted, every further
    /// call returns `repeat`. Each invocation is counted and its start time
    /// (tokio clock, so paused-time tests see virtual time) recorded.
    #[derive(Debug)]
    pub struct ScriptedOperation<T, E> {
        script: Mutex<VecDeque<Result<T, E>>>,
        repeat: Result<T, E>,
        latency: Duration,
        calls: AtomicU32,
        started: Mutex<Vec<Instant>>,
    }

    impl<T: Clone, E: Clone> ScriptedOperation<T, E> {
        /// Play `script`, then `repeat` forever.
        #[must_use]
        pub fn new(script: Vec<Result<T, E>>, repeat: Result<T, E>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                repeat,
                latency: Duration::ZERO,
                calls: AtomicU32::new(0),
                started: Mutex::new(Vec::new()),
            }
        }

        /// Return `result` on every call.
        #[must_use]
        pub fn always(result: Result<T, E>) -> Self {
            Self::new(Vec::new(), result)
        }

        /// Sleep this long before producing each result.
        #[must_use]
        pub const fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Invoke the operation.
        ///
        /// # Errors
        ///
        /// Returns the scripted error for this invocation, if any.
        pub async fn call(&self) -> Result<T, E> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Instant::now());

            let next = self
                .script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| self.repeat.clone());

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            next
        }

        /// Number of invocations so far.
        #[must_use]
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Time between consecutive invocation starts.
        #[must_use]
        pub fn gaps(&self) -> Vec<Duration> {
            let started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
            started
                .windows(2)
                .map(|pair| pair[1].saturating_duration_since(pair[0]))
                .collect()
        }
    }
}

/// Simulated failures of external HTTP APIs.
pub mod errors {
    use taskpilot_resilience::retry::{Retryable, is_retryable_status};
    use thiserror::Error;

    /// A failure as an HTTP client would report it.
    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum SimulatedHttpError {
        /// Non-success status code
        #[error("HTTP {0}")]
        Status(u16),
        /// Request timed out
        #[error("request timed out")]
        Timeout,
        /// Problem on our side, unrelated to dependency health
        #[error("invalid request: {0}")]
        Invalid(String),
    }

    impl Retryable for SimulatedHttpError {
        fn is_retryable(&self) -> bool {
            match self {
                Self::Status(status) => is_retryable_status(*status),
                Self::Timeout => true,
                Self::Invalid(_) => false,
            }
        }

        fn counts_against_breaker(&self) -> bool {
            !matches!(self, Self::Invalid(_))
        }
    }
}

/// Install a test-writer tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub use errors::SimulatedHttpError;
pub use mocks::{FixedClock, test_clock};
pub use operations::ScriptedOperation;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::time::Duration;
    use taskpilot_resilience::retry::Retryable;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_operation_plays_then_repeats() {
        let op = ScriptedOperation::new(
            vec![Err(SimulatedHttpError::Status(500)), Ok(1)],
            Err(SimulatedHttpError::Timeout),
        )
        .with_latency(Duration::from_millis(5));

        assert_eq!(op.call().await, Err(SimulatedHttpError::Status(500)));
        assert_eq!(op.call().await, Ok(1));
        assert_eq!(op.call().await, Err(SimulatedHttpError::Timeout));
        assert_eq!(op.call().await, Err(SimulatedHttpError::Timeout));
        assert_eq!(op.calls(), 4);
        assert_eq!(op.gaps(), vec![Duration::from_millis(5); 3]);
    }

    #[test]
    fn test_simulated_error_classification() {
        assert!(SimulatedHttpError::Status(503).is_retryable());
        assert!(SimulatedHttpError::Status(429).is_retryable());
        assert!(!SimulatedHttpError::Status(404).is_retryable());
        assert!(SimulatedHttpError::Timeout.is_retryable());

        let invalid = SimulatedHttpError::Invalid("missing key".into());
        assert!(!invalid.is_retryable());
        assert!(!invalid.counts_against_breaker());
        assert!(SimulatedHttpError::Status(500).counts_against_breaker());
    }
}
