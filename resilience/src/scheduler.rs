//! Background loops that run jobs on a schedule and survive their failures.
//!
//! A job that returns an error or panics is logged, the loop waits a fallback
//! delay, and scheduling resumes. Only the shutdown signal ends a loop.

use crate::clock::Clock;
use crate::metrics::SchedulerMetrics;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// When a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once a day at the given UTC wall time.
    DailyAt {
        /// Hour, 0-23
        hour: u32,
        /// Minute, 0-59
        minute: u32,
    },
    /// Repeatedly, this long after each run is scheduled.
    Every(Duration),
}

impl Schedule {
    /// Time from `now` until the next run.
    ///
    /// For [`Schedule::DailyAt`], a target equal to `now` is pushed to the next
    /// day. Out-of-range hours and minutes are clamped.
    #[must_use]
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match *self {
            Self::Every(interval) => interval,
            Self::DailyAt { hour, minute } => {
                let at = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0)
                    .unwrap_or_default();
                let mut next = now.date_naive().and_time(at).and_utc();
                if next <= now {
                    next += TimeDelta::days(1);
                }
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

/// A unit of recurring background work.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Job name for logging and metrics
    fn name(&self) -> &str;

    /// Do one run.
    ///
    /// # Errors
    ///
    /// Any error is logged by the loop, which then backs off and continues.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Run `job` on `schedule` until `shutdown` fires.
///
/// After a failed or panicking run the loop sleeps `fallback_delay` before
/// computing the next scheduled instant.
pub async fn run_scheduled(
    job: Arc<dyn ScheduledJob>,
    schedule: Schedule,
    fallback_delay: Duration,
    clock: Arc<dyn Clock>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let name = job.name().to_string();
    tracing::info!(job = %name, ?schedule, "Scheduler loop started");

    loop {
        let delay = schedule.next_delay(clock.now());
        tracing::debug!(job = %name, delay_secs = delay.as_secs_f64(), "Next run scheduled");

        tokio::select! {
            _ = shutdown.recv() => break,
            () = tokio::time::sleep(delay) => {}
        }

        let failed = match AssertUnwindSafe(job.run()).catch_unwind().await {
            Ok(Ok(())) => {
                tracing::info!(job = %name, "Scheduled job completed");
                SchedulerMetrics::record_run(&name, "success");
                false
            }
            Ok(Err(e)) => {
                tracing::error!(job = %name, error = ?e, "Scheduled job failed");
                SchedulerMetrics::record_run(&name, "error");
                true
            }
            Err(panic) => {
                tracing::error!(
                    job = %name,
                    panic = panic_message(panic.as_ref()),
                    "Scheduled job panicked"
                );
                SchedulerMetrics::record_run(&name, "panic");
                true
            }
        };

        if failed {
            tracing::warn!(
                job = %name,
                fallback_secs = fallback_delay.as_secs_f64(),
                "Backing off before next run"
            );
            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(fallback_delay) => {}
            }
        }
    }

    tracing::info!(job = %name, "Scheduler loop stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    struct StoppedClock(DateTime<Utc>);

    impl Clock for StoppedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn test_daily_later_today() {
        let schedule = Schedule::DailyAt { hour: 8, minute: 30 };
        let delay = schedule.next_delay(at("2025-01-01T06:00:00Z"));
        assert_eq!(delay, Duration::from_secs(2 * 3600 + 30 * 60));
    }

    #[test]
    fn test_daily_rolls_to_tomorrow() {
        let schedule = Schedule::DailyAt { hour: 2, minute: 0 };
        assert_eq!(
            schedule.next_delay(at("2025-01-01T02:00:00Z")),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            schedule.next_delay(at("2025-01-01T23:00:00Z")),
            Duration::from_secs(3 * 3600)
        );
    }

    #[test]
    fn test_every_ignores_clock() {
        let schedule = Schedule::Every(Duration::from_secs(90));
        assert_eq!(schedule.next_delay(at("2025-06-01T12:00:00Z")), Duration::from_secs(90));
    }

    struct FlakyJob {
        runs: AtomicU32,
    }

    #[async_trait]
    impl ScheduledJob for FlakyJob {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self) -> anyhow::Result<()> {
            match self.runs.fetch_add(1, Ordering::SeqCst) {
                0 => anyhow::bail!("database unavailable"),
                1 => panic!("job bug"),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_errors_and_panics() {
        let job = Arc::new(FlakyJob {
            runs: AtomicU32::new(0),
        });
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_scheduled(
            Arc::clone(&job) as Arc<dyn ScheduledJob>,
            Schedule::Every(Duration::from_secs(10)),
            Duration::from_secs(60),
            Arc::new(StoppedClock(at("2025-01-01T00:00:00Z"))),
            rx,
        ));

        // t=10 error, t=80 panic, t=150 ok
        tokio::time::sleep(Duration::from_secs(155)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let job = Arc::new(FlakyJob {
            runs: AtomicU32::new(2),
        });
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_scheduled(
            Arc::clone(&job) as Arc<dyn ScheduledJob>,
            Schedule::DailyAt { hour: 3, minute: 0 },
            Duration::from_secs(3600),
            Arc::new(StoppedClock(at("2025-01-01T04:00:00Z"))),
            rx,
        ));

        tokio::task::yield_now().await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
