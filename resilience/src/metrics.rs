//! Prometheus metrics for the resilience layer.
//!
//! Recorders are zero-sized types grouping the `metrics` macro calls per
//! component. Without an installed recorder every call is a no-op, so
//! libraries and tests can record freely.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskpilot_resilience::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::{CircuitState, Outcome};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter (includes binding the listener)
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the global recorder
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or the
    /// address cannot be bound, and [`MetricsError::Install`] if a global
    /// recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        // Descriptions go to whichever recorder is installed, so register after.
        register_metrics();

        let addr = self.addr;
        tokio::spawn(async move {
            // The exporter error carries no printable detail.
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics exporter stopped");
            }
        });

        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Circuit breakers
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Calls that ran through a circuit breaker, by outcome"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Calls rejected without invoking the dependency"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );

    // Rate limiters
    describe_counter!(
        "rate_limiter_decisions_total",
        "Rate limiter admission decisions"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Retries after a failed attempt");
    describe_counter!(
        "retry_exhausted_total",
        "Operations that used up every retry attempt"
    );

    // External calls
    describe_histogram!(
        "external_api_duration_seconds",
        "End-to-end duration of resilient external calls"
    );

    // Scheduler
    describe_counter!("scheduler_runs_total", "Scheduled job runs, by outcome");
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(circuit: &str, state: CircuitState) {
        gauge!("circuit_breaker_state", "circuit" => circuit.to_string()).set(state.gauge_value());
    }

    pub(crate) fn record_outcome(circuit: &str, outcome: Outcome) {
        let outcome = match outcome {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Uncounted => "uncounted",
        };
        counter!(
            "circuit_breaker_calls_total",
            "circuit" => circuit.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(circuit: &str) {
        counter!("circuit_breaker_rejections_total", "circuit" => circuit.to_string()).increment(1);
    }

    /// Record a state transition and the resulting state.
    pub fn record_transition(circuit: &str, from: CircuitState, to: CircuitState) {
        counter!(
            "circuit_breaker_transitions_total",
            "circuit" => circuit.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        Self::record_state(circuit, to);
    }
}

/// Rate limiter metrics recorder.
pub struct RateLimiterMetrics;

impl RateLimiterMetrics {
    /// Record an admitted request.
    pub fn record_admitted(limiter: &str) {
        counter!("rate_limiter_decisions_total", "limiter" => limiter.to_string(), "decision" => "admitted")
            .increment(1);
    }

    /// Record a denied request.
    pub fn record_denied(limiter: &str) {
        counter!("rate_limiter_decisions_total", "limiter" => limiter.to_string(), "decision" => "denied")
            .increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt(operation: &str) {
        counter!("retry_attempts_total", "operation" => operation.to_string()).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(operation: &str) {
        counter!("retry_exhausted_total", "operation" => operation.to_string()).increment(1);
    }
}

/// External API call metrics recorder.
pub struct ExternalApiMetrics;

impl ExternalApiMetrics {
    /// Record the duration of one resilient call.
    pub fn record_duration(service: &str, operation: &str, duration: Duration) {
        histogram!(
            "external_api_duration_seconds",
            "service" => service.to_string(),
            "operation" => operation.to_string()
        )
        .record(duration.as_secs_f64());
    }
}

/// Scheduler metrics recorder.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record one job run.
    ///
    /// `outcome` is one of `success`, `error` or `panic`.
    pub fn record_run(job: &str, outcome: &'static str) {
        counter!("scheduler_runs_total", "job" => job.to_string(), "outcome" => outcome).increment(1);
    }
}
