//! Wall-clock abstraction for schedule computation.
//!
//! Breakers and limiters measure elapsed time with `tokio::time::Instant`,
//! which tests control by pausing the runtime. Calendar-based work (daily jobs)
//! needs the actual date, which is what [`Clock`] provides.

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
///
/// # Examples
///
/// ```
/// use taskpilot_resilience::clock::{Clock, SystemClock};
///
/// let now = SystemClock.now();
/// assert!(now.timestamp() > 0);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
