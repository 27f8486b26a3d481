//! Sliding-window rate limiter bounding outbound call volume per resource.
//!
//! ```text
//! window = 60s, max_requests = 3
//!
//! t=0s   acquire ✓  [0]
//! t=1s   acquire ✓  [0, 1]
//! t=2s   acquire ✓  [0, 1, 2]
//! t=30s  acquire ✗  [0, 1, 2]      (full, nothing recorded)
//! t=60s  acquire ✓  [1, 2, 60]     (t=0 aged out)
//! ```
//!
//! The limiter is independent of circuit breaker health: it protects a
//! provider's quota even when every call succeeds.
//!
//! An entry expires once its age reaches the window length, so no half-open
//! interval `[t, t + window)` ever holds more than `max_requests` admissions.

use crate::metrics::RateLimiterMetrics;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Admissions allowed within one window
    pub max_requests: usize,
    /// Sliding window length
    pub window: Duration,
    /// Interval between attempts in [`RateLimiter::wait_for_slot`]
    pub poll_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

impl RateLimiterConfig {
    /// Configuration with the default one-second poll interval.
    #[must_use]
    pub const fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Override the `wait_for_slot` poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// A request was denied because the window is full.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "rate limit exceeded for '{limiter}': {max_requests} requests per {}s, retry in {:.1}s",
    window.as_secs_f64(),
    retry_after.as_secs_f64()
)]
pub struct RateLimitExceeded {
    /// Limiter name
    pub limiter: String,
    /// Configured cap
    pub max_requests: usize,
    /// Configured window
    pub window: Duration,
    /// Time until the oldest admission leaves the window
    pub retry_after: Duration,
}

/// Read-only snapshot of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStatus {
    /// Limiter name
    pub name: String,
    /// Admissions currently inside the window
    pub current_count: usize,
    /// Configured cap
    pub max_requests: usize,
    /// Window length in seconds
    pub window_seconds: f64,
    /// `max_requests - current_count`
    pub available_slots: usize,
    /// Seconds until the oldest live admission expires (0 when empty)
    pub next_reset_in_seconds: f64,
}

/// Admission timestamps, oldest first.
#[derive(Debug, Default)]
pub(crate) struct SlidingWindow {
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn is_expired(at: Instant, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(at) >= window
    }

    fn purge(&mut self, window: Duration, now: Instant) {
        while self
            .timestamps
            .front()
            .is_some_and(|&at| Self::is_expired(at, window, now))
        {
            self.timestamps.pop_front();
        }
    }

    /// Purge, check and record in one step. Denial leaves the window untouched
    /// apart from the purge.
    pub(crate) fn try_admit(&mut self, max_requests: usize, window: Duration, now: Instant) -> bool {
        self.purge(window, now);
        if self.timestamps.len() < max_requests {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    pub(crate) fn live_count(&self, window: Duration, now: Instant) -> usize {
        self.timestamps
            .iter()
            .filter(|&&at| !Self::is_expired(at, window, now))
            .count()
    }

    pub(crate) fn next_reset(&self, window: Duration, now: Instant) -> Duration {
        self.timestamps
            .iter()
            .find(|&&at| !Self::is_expired(at, window, now))
            .map_or(Duration::ZERO, |&oldest| {
                window.saturating_sub(now.saturating_duration_since(oldest))
            })
    }
}

/// Named sliding-window rate limiter.
///
/// Shared by every task calling the protected resource. Purge, check and
/// append happen under one lock so concurrent callers cannot both take the
/// last slot.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    window: Mutex<SlidingWindow>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Arguments
    ///
    /// * `name` - Name for logging and metrics (e.g., `gemini_api`)
    /// * `config` - Cap, window and poll interval
    #[must_use]
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let name = name.into();
        tracing::info!(
            limiter = %name,
            max_requests = config.max_requests,
            window_secs = config.window.as_secs_f64(),
            "Rate limiter initialized"
        );
        Self {
            name,
            config,
            window: Mutex::new(SlidingWindow::default()),
        }
    }

    /// Limiter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Try to admit one request now.
    ///
    /// Returns `false` without recording anything when the window is full.
    pub fn acquire(&self, caller: Option<&str>) -> bool {
        let caller = caller.unwrap_or("anonymous");
        let mut window = self.lock();
        let admitted = window.try_admit(self.config.max_requests, self.config.window, Instant::now());
        let current = window.timestamps.len();
        drop(window);

        if admitted {
            tracing::debug!(
                limiter = %self.name,
                caller,
                current,
                max_requests = self.config.max_requests,
                "Rate limit slot acquired"
            );
            RateLimiterMetrics::record_admitted(&self.name);
        } else {
            tracing::warn!(
                limiter = %self.name,
                caller,
                current,
                max_requests = self.config.max_requests,
                window_secs = self.config.window.as_secs_f64(),
                "Rate limit exceeded"
            );
            RateLimiterMetrics::record_denied(&self.name);
        }
        admitted
    }

    /// Like [`acquire`](Self::acquire), reporting denial as an error.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the window is full.
    pub fn acquire_or_err(&self, caller: Option<&str>) -> Result<(), RateLimitExceeded> {
        if self.acquire(caller) {
            Ok(())
        } else {
            Err(self.exceeded())
        }
    }

    /// Denial error describing the current window.
    pub(crate) fn exceeded(&self) -> RateLimitExceeded {
        let retry_after = self.lock().next_reset(self.config.window, Instant::now());
        RateLimitExceeded {
            limiter: self.name.clone(),
            max_requests: self.config.max_requests,
            window: self.config.window,
            retry_after,
        }
    }

    /// Poll [`acquire`](Self::acquire) every `poll_interval` until admitted or
    /// `max_wait` has elapsed.
    ///
    /// A final attempt is made at the deadline. Returns `false` on timeout.
    pub async fn wait_for_slot(&self, caller: Option<&str>, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.acquire(caller) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::error!(
                    limiter = %self.name,
                    caller = caller.unwrap_or("anonymous"),
                    max_wait_secs = max_wait.as_secs_f64(),
                    "Timed out waiting for rate limit slot"
                );
                return false;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Snapshot of the window. Expired entries are skipped, not purged.
    #[must_use]
    pub fn status(&self) -> RateLimiterStatus {
        let now = Instant::now();
        let window = self.lock();
        let current_count = window.live_count(self.config.window, now);
        let next_reset = window.next_reset(self.config.window, now);
        drop(window);

        RateLimiterStatus {
            name: self.name.clone(),
            current_count,
            max_requests: self.config.max_requests,
            window_seconds: self.config.window.as_secs_f64(),
            available_slots: self.config.max_requests.saturating_sub(current_count),
            next_reset_in_seconds: next_reset.as_secs_f64(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlidingWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(max_requests: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimiterConfig::new(max_requests, Duration::from_secs(window_secs)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_has_no_side_effect() {
        let limiter = limiter(2, 10);
        assert!(limiter.acquire(None));
        assert!(limiter.acquire(Some("user-1")));

        for _ in 0..5 {
            assert!(!limiter.acquire(None));
        }
        assert_eq!(limiter.status().current_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_at_window_boundary() {
        let limiter = limiter(1, 10);
        assert!(limiter.acquire(None));

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(!limiter.acquire(None));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.acquire(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_read_only() {
        let limiter = limiter(3, 10);
        assert!(limiter.acquire(None));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.acquire(None));

        let status = limiter.status();
        assert_eq!(status.current_count, 2);
        assert_eq!(status.available_slots, 1);
        assert!((status.next_reset_in_seconds - 6.0).abs() < 1e-9);
        assert!((status.window_seconds - 10.0).abs() < f64::EPSILON);

        tokio::time::advance(Duration::from_secs(7)).await;
        let status = limiter.status();
        assert_eq!(status.current_count, 1);
        // Expired entry is still stored until the next acquire purges it.
        assert_eq!(limiter.lock().timestamps.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_status() {
        let status = limiter(5, 60).status();
        assert_eq!(status.name, "test");
        assert_eq!(status.current_count, 0);
        assert_eq!(status.available_slots, 5);
        assert!(status.next_reset_in_seconds.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_or_err_reports_retry_after() {
        let limiter = limiter(1, 30);
        limiter.acquire_or_err(None).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let err = limiter.acquire_or_err(Some("analyzer")).unwrap_err();
        assert_eq!(err.limiter, "test");
        assert_eq!(err.max_requests, 1);
        assert_eq!(err.retry_after, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_succeeds_once_window_frees() {
        let limiter = limiter(1, 5);
        assert!(limiter.acquire(None));

        let start = Instant::now();
        assert!(limiter.wait_for_slot(None, Duration::from_secs(10)).await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_times_out() {
        let limiter = limiter(1, 60);
        assert!(limiter.acquire(None));

        let start = Instant::now();
        assert!(!limiter.wait_for_slot(None, Duration::from_millis(2_500)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_poll_interval() {
        let limiter = RateLimiter::new(
            "fast",
            RateLimiterConfig::new(1, Duration::from_millis(250))
                .with_poll_interval(Duration::from_millis(50)),
        );
        assert!(limiter.acquire(None));

        let start = Instant::now();
        assert!(limiter.wait_for_slot(None, Duration::from_secs(1)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_cap() {
        let limiter = Arc::new(limiter(10, 60));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire(None) })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
