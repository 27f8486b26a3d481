//! Graceful shutdown of background loops.
//!
//! Loops subscribe to a broadcast signal and are tracked by their join
//! handles. On shutdown the signal is sent, then every loop gets the same
//! grace period to finish; stragglers are aborted.
//!
//! ```ignore
//! let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
//! let rx = coordinator.subscribe();
//! coordinator.track("status_report", tokio::spawn(run_loop(rx)));
//!
//! wait_for_signal().await?;
//! coordinator.shutdown().await?;
//! ```

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Broadcasts shutdown and waits for tracked tasks.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    tasks: Vec<(String, JoinHandle<()>)>,
    shutdown_tx: broadcast::Sender<()>,
    timeout_duration: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long tasks may take to stop after the signal
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            tasks: Vec::new(),
            shutdown_tx,
            timeout_duration: timeout,
        }
    }

    /// Get a receiver for the shutdown signal
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for `handle` during shutdown.
    pub fn track(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        info!(task = %name, "Tracking background task");
        self.tasks.push((name, handle));
    }

    /// Number of tracked tasks
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Send the signal and wait for every tracked task
    ///
    /// # Errors
    ///
    /// Returns one message per task that panicked or had to be aborted
    pub async fn shutdown(self) -> Result<(), Vec<String>> {
        info!(
            tasks = self.tasks.len(),
            timeout_secs = self.timeout_duration.as_secs_f64(),
            "Initiating graceful shutdown"
        );

        if self.shutdown_tx.send(()).is_err() {
            warn!("No active shutdown signal receivers");
        }

        let timeout = self.timeout_duration;
        let waits = self.tasks.into_iter().map(|(name, mut handle)| async move {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {
                    info!(task = %name, "Task stopped");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(task = %name, error = %e, "Task ended abnormally");
                    Err(format!("{name}: {e}"))
                }
                Err(_) => {
                    handle.abort();
                    error!(task = %name, "Task did not stop in time, aborted");
                    Err(format!("{name}: timeout after {timeout:?}"))
                }
            }
        });

        let errors: Vec<String> = futures::future::join_all(waits)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            info!("All tasks stopped");
            Ok(())
        } else {
            error!(errors = errors.len(), "Shutdown completed with errors");
            Err(errors)
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
///
/// # Errors
///
/// Returns error if the signal handlers cannot be installed
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
