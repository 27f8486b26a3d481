//! Circuit breaker pattern for isolating a failing external dependency.
//!
//! A circuit breaker monitors calls to one named dependency and "opens" (stops
//! invoking it) when consecutive failures reach a threshold. After a cooldown it
//! lets a few probe calls through to find out whether the dependency recovered.
//!
//! # States
//!
//! ```text
//! Closed ──[failure streak >= failure_threshold]──> Open
//!                                                     │
//!                                  [next call after recovery_timeout]
//!                                                     ▼
//!                                                 HalfOpen
//!                                                     │
//!              ┌──────────────────────────────────────┴──────────────┐
//!   [success streak >= success_threshold]                     [any failure]
//!              ▼                                                     ▼
//!           Closed                                                 Open
//! ```
//!
//! # Lazy recovery
//!
//! The Open → `HalfOpen` transition is evaluated when a call arrives, never by a
//! background timer. A breaker that nobody calls stays Open forever, which costs
//! nothing. Do not replace this with an eager timer task per breaker.
//!
//! # Failure classification
//!
//! Operations report failures as [`Failure::Counted`] (the dependency is
//! unhealthy) or [`Failure::Uncounted`] (our own bug, bad input, ...). Only
//! counted failures and call timeouts move the breaker towards Open; uncounted
//! failures are passed through untouched. [`CircuitBreaker::call`] treats every
//! error as counted.
//!
//! # Example
//!
//! ```rust
//! use taskpilot_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(3)
//!     .recovery_timeout(Duration::from_secs(30))
//!     .call_timeout(Duration::from_secs(10))
//!     .success_threshold(2)
//!     .build();
//!
//! let breaker = CircuitBreaker::new("gemini_api", config);
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(value) => println!("Success: {value}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use crate::metrics::CircuitBreakerMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration.
///
/// Immutable once the breaker is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays Open before a probe is allowed
    pub recovery_timeout: Duration,
    /// Wall-clock budget for a single call
    pub call_timeout: Duration,
    /// Consecutive `HalfOpen` successes required to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder seeded with the defaults.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            recovery_timeout: None,
            call_timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<u32>,
    recovery_timeout: Option<Duration>,
    call_timeout: Option<Duration>,
    success_threshold: Option<u32>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive failures.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long to wait in Open state before probing.
    #[must_use]
    pub const fn recovery_timeout(mut self, duration: Duration) -> Self {
        self.recovery_timeout = Some(duration);
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn call_timeout(mut self, duration: Duration) -> Self {
        self.call_timeout = Some(duration);
        self
    }

    /// Set the success threshold.
    ///
    /// Number of consecutive successes in `HalfOpen` state before closing the circuit.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    ///
    /// Thresholds below one are raised to one.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            recovery_timeout: self.recovery_timeout.unwrap_or(defaults.recovery_timeout),
            call_timeout: self.call_timeout.unwrap_or(defaults.call_timeout),
            success_threshold: self
                .success_threshold
                .unwrap_or(defaults.success_threshold)
                .max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls are rejected without invoking the dependency
    Open,
    /// A limited number of probe calls test whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The circuit rejected a call without invoking the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{circuit}' is {state}, retry in {:.1}s", retry_after.as_secs_f64())]
pub struct CircuitOpenError {
    /// Dependency name
    pub circuit: String,
    /// State at rejection time (`Open`, or `HalfOpen` when all probe slots are busy)
    pub state: CircuitState,
    /// Current failure streak
    pub failure_count: u32,
    /// Time until a call may be attempted again
    pub retry_after: Duration,
}

/// The operation exceeded the breaker's call timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{circuit}' call timed out after {}s", timeout.as_secs_f64())]
pub struct CircuitTimeoutError {
    /// Dependency name
    pub circuit: String,
    /// The deadline that was exceeded
    pub timeout: Duration,
}

/// How an operation failure should be treated by the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// The dependency misbehaved; counts towards opening the circuit.
    Counted(E),
    /// Unrelated to dependency health; passed through without bookkeeping.
    Uncounted(E),
}

impl<E> Failure<E> {
    /// Extract the wrapped error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Counted(e) | Self::Uncounted(e) => e,
        }
    }
}

/// Errors from circuit breaker calls.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Circuit is open, the operation was not invoked
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    /// Operation exceeded the call timeout (counted)
    #[error(transparent)]
    Timeout(#[from] CircuitTimeoutError),
    /// Operation failed with a counted failure
    #[error("{0}")]
    Failed(E),
    /// Operation failed with an uncounted failure
    #[error("{0}")]
    Uncounted(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected because the circuit is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    /// Whether the operation was invoked and hit the call timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The operation's own error, if the operation ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(e) | Self::Uncounted(e) => Some(e),
            Self::Open(_) | Self::Timeout(_) => None,
        }
    }
}

/// Terminal outcome of an admitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    Uncounted,
}

/// A state change, reported so the caller can log and record it.
pub(crate) type Transition = (CircuitState, CircuitState);

/// Ticket handed out on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Permit {
    /// Set when the call is a `HalfOpen` probe, holding the generation it was admitted in.
    probe_generation: Option<u64>,
}

/// Breaker bookkeeping, driven by explicit timestamps.
///
/// Lifetime counters live next to the streaks so a single lock acquisition
/// updates them together; `total_calls == total_successes + total_failures`
/// holds at every observation.
#[derive(Debug)]
pub(crate) struct BreakerCore {
    state: CircuitState,
    failure_streak: u32,
    success_streak: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probes_in_flight: u32,
    // Bumped on every transition so stale probes cannot release newer slots.
    generation: u64,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerCore {
    pub(crate) const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_streak: 0,
            success_streak: 0,
            last_failure: None,
            last_failure_at: None,
            probes_in_flight: 0,
            generation: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    pub(crate) const fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) const fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    pub(crate) const fn success_streak(&self) -> u32 {
        self.success_streak
    }

    fn transition(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.probes_in_flight = 0;
        (from, to)
    }

    /// Decide whether a call may proceed at `now`.
    ///
    /// Returns the admission decision (a permit, or the time until retry) and the
    /// Open → `HalfOpen` transition when this call is the one that triggers it.
    pub(crate) fn admit(
        &mut self,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> (Result<Permit, Duration>, Option<Transition>) {
        let mut transition = None;

        if self.state == CircuitState::Open {
            let elapsed = self
                .last_failure
                .map_or(config.recovery_timeout, |at| now.saturating_duration_since(at));
            if elapsed < config.recovery_timeout {
                self.total_rejections += 1;
                return (Err(config.recovery_timeout - elapsed), None);
            }
            transition = Some(self.transition(CircuitState::HalfOpen));
            self.success_streak = 0;
            self.failure_streak = 0;
        }

        match self.state {
            CircuitState::Closed => (Ok(Permit { probe_generation: None }), transition),
            CircuitState::HalfOpen => {
                if self.probes_in_flight >= config.success_threshold {
                    self.total_rejections += 1;
                    return (Err(Duration::ZERO), transition);
                }
                self.probes_in_flight += 1;
                (
                    Ok(Permit {
                        probe_generation: Some(self.generation),
                    }),
                    transition,
                )
            }
            CircuitState::Open => (Err(config.recovery_timeout), transition),
        }
    }

    /// Give back a probe slot without recording an outcome (cancelled call).
    pub(crate) fn release(&mut self, permit: Permit) {
        if permit.probe_generation == Some(self.generation) {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
    }

    /// Record the terminal outcome of an admitted call.
    pub(crate) fn record(
        &mut self,
        config: &CircuitBreakerConfig,
        permit: Permit,
        outcome: Outcome,
        now: Instant,
    ) -> Option<Transition> {
        let current_probe = permit.probe_generation == Some(self.generation);
        self.release(permit);
        self.total_calls += 1;

        match outcome {
            Outcome::Success => {
                self.total_successes += 1;
                match self.state {
                    CircuitState::Closed => {
                        self.failure_streak = 0;
                        None
                    }
                    // Only probes admitted in this half-open period prove recovery.
                    CircuitState::HalfOpen if !current_probe => None,
                    CircuitState::HalfOpen => {
                        self.success_streak += 1;
                        if self.success_streak >= config.success_threshold {
                            self.failure_streak = 0;
                            self.success_streak = 0;
                            Some(self.transition(CircuitState::Closed))
                        } else {
                            None
                        }
                    }
                    // A straggler admitted before the circuit opened.
                    CircuitState::Open => None,
                }
            }
            Outcome::Failure => {
                self.total_failures += 1;
                self.last_failure = Some(now);
                self.last_failure_at = Some(Utc::now());
                self.failure_streak = self.failure_streak.saturating_add(1);
                match self.state {
                    CircuitState::Closed if self.failure_streak >= config.failure_threshold => {
                        self.success_streak = 0;
                        Some(self.transition(CircuitState::Open))
                    }
                    CircuitState::HalfOpen => {
                        self.success_streak = 0;
                        self.failure_streak = 1;
                        Some(self.transition(CircuitState::Open))
                    }
                    CircuitState::Closed | CircuitState::Open => None,
                }
            }
            Outcome::Uncounted => {
                self.total_failures += 1;
                None
            }
        }
    }

    fn force_closed(&mut self) -> Option<Transition> {
        self.failure_streak = 0;
        self.success_streak = 0;
        if self.state == CircuitState::Closed {
            None
        } else {
            Some(self.transition(CircuitState::Closed))
        }
    }
}

/// Configuration as reported in [`CircuitBreakerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfigSummary {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Cooldown in seconds
    pub recovery_timeout_secs: f64,
    /// Per-call deadline in seconds
    pub call_timeout_secs: f64,
    /// Consecutive probe successes that close the circuit
    pub success_threshold: u32,
}

impl From<&CircuitBreakerConfig> for ConfigSummary {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout_secs: config.recovery_timeout.as_secs_f64(),
            call_timeout_secs: config.call_timeout.as_secs_f64(),
            success_threshold: config.success_threshold,
        }
    }
}

/// Point-in-time view of a breaker, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Calls that ran to a terminal outcome
    pub total_calls: u64,
    /// Calls that succeeded
    pub total_successes: u64,
    /// Calls that failed (counted, uncounted or timed out)
    pub total_failures: u64,
    /// Calls rejected without invoking the operation
    pub total_rejections: u64,
    /// Current consecutive failure streak
    pub failure_count: u32,
    /// Current consecutive `HalfOpen` success streak
    pub success_count: u32,
    /// `total_successes / max(total_calls, 1)`
    pub success_rate: f64,
    /// Wall-clock time of the most recent counted failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Configuration in effect
    pub config: ConfigSummary,
}

/// Circuit breaker guarding a single named dependency.
///
/// Safe to share between tasks; the internal lock is held only for
/// bookkeeping, never across the wrapped operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the Closed state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(
            circuit = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs_f64(),
            call_timeout_secs = config.call_timeout.as_secs_f64(),
            success_threshold = config.success_threshold,
            "Circuit breaker initialized"
        );
        CircuitBreakerMetrics::record_state(&name, CircuitState::Closed);
        Self {
            name,
            config,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    /// Dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    ///
    /// An Open breaker whose cooldown has elapsed still reports Open until the
    /// next call arrives.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    /// Current consecutive failure streak.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_streak()
    }

    /// Call an operation through the circuit breaker, counting every error.
    ///
    /// # Errors
    ///
    /// - [`CircuitError::Open`] if the circuit is open (operation not invoked)
    /// - [`CircuitError::Timeout`] if the operation exceeded the call timeout
    /// - [`CircuitError::Failed`] with the operation's own error
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(|| async move { operation().await.map_err(Failure::Counted) })
            .await
    }

    /// Call an operation that classifies its own failures.
    ///
    /// The operation runs under the call timeout; when the deadline passes its
    /// future is dropped, which cancels any in-flight I/O it owns.
    ///
    /// # Errors
    ///
    /// - [`CircuitError::Open`] if the circuit is open (operation not invoked)
    /// - [`CircuitError::Timeout`] if the operation exceeded the call timeout
    /// - [`CircuitError::Failed`] for [`Failure::Counted`]
    /// - [`CircuitError::Uncounted`] for [`Failure::Uncounted`]
    pub async fn call_classified<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure<E>>>,
    {
        let guard = self.admit()?;

        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                guard.complete(Outcome::Success);
                Ok(value)
            }
            Ok(Err(Failure::Counted(err))) => {
                tracing::error!(circuit = %self.name, "Circuit breaker call failed");
                guard.complete(Outcome::Failure);
                Err(CircuitError::Failed(err))
            }
            Ok(Err(Failure::Uncounted(err))) => {
                tracing::error!(
                    circuit = %self.name,
                    "Circuit breaker call failed with an uncounted error"
                );
                guard.complete(Outcome::Uncounted);
                Err(CircuitError::Uncounted(err))
            }
            Err(_elapsed) => {
                tracing::error!(
                    circuit = %self.name,
                    timeout_secs = self.config.call_timeout.as_secs_f64(),
                    "Circuit breaker call timed out"
                );
                guard.complete(Outcome::Failure);
                Err(CircuitError::Timeout(CircuitTimeoutError {
                    circuit: self.name.clone(),
                    timeout: self.config.call_timeout,
                }))
            }
        }
    }

    fn admit(&self) -> Result<CallGuard<'_>, CircuitOpenError> {
        let mut core = self.lock();
        let (decision, transition) = core.admit(&self.config, Instant::now());
        if let Some(transition) = transition {
            self.report_transition(transition, &core);
        }

        match decision {
            Ok(permit) => Ok(CallGuard {
                breaker: self,
                permit: Some(permit),
            }),
            Err(retry_after) => {
                let failure_count = core.failure_streak();
                let state = core.state();
                drop(core);
                tracing::warn!(
                    circuit = %self.name,
                    state = %state,
                    failure_count,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "Circuit breaker rejecting call"
                );
                CircuitBreakerMetrics::record_rejection(&self.name);
                Err(CircuitOpenError {
                    circuit: self.name.clone(),
                    state,
                    failure_count,
                    retry_after,
                })
            }
        }
    }

    fn finish(&self, permit: Permit, outcome: Outcome) {
        let mut core = self.lock();
        let transition = core.record(&self.config, permit, outcome, Instant::now());
        if let Some(transition) = transition {
            self.report_transition(transition, &core);
        }
        drop(core);
        CircuitBreakerMetrics::record_outcome(&self.name, outcome);
    }

    fn report_transition(&self, (from, to): Transition, core: &BreakerCore) {
        match to {
            CircuitState::Open => tracing::warn!(
                circuit = %self.name,
                from = %from,
                failure_count = core.failure_streak(),
                threshold = self.config.failure_threshold,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::info!(
                circuit = %self.name,
                from = %from,
                "Circuit breaker transitioning to half-open"
            ),
            CircuitState::Closed => tracing::info!(
                circuit = %self.name,
                from = %from,
                "Circuit breaker closed"
            ),
        }
        CircuitBreakerMetrics::record_transition(&self.name, from, to);
    }

    /// Snapshot of counters, streaks and configuration. Does not mutate state.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CircuitBreakerStats {
        let core = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: core.state,
            total_calls: core.total_calls,
            total_successes: core.total_successes,
            total_failures: core.total_failures,
            total_rejections: core.total_rejections,
            failure_count: core.failure_streak,
            success_count: core.success_streak,
            success_rate: core.total_successes as f64 / core.total_calls.max(1) as f64,
            last_failure_at: core.last_failure_at,
            config: ConfigSummary::from(&self.config),
        }
    }

    /// Force the breaker back to Closed with empty streaks.
    ///
    /// Lifetime counters are kept. Intended for manual intervention.
    pub fn reset(&self) {
        let mut core = self.lock();
        if let Some(transition) = core.force_closed() {
            self.report_transition(transition, &core);
        }
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a probe slot if the call future is dropped before completing.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl CallGuard<'_> {
    fn complete(mut self, outcome: Outcome) {
        if let Some(permit) = self.permit.take() {
            self.breaker.finish(permit, outcome);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.lock().release(permit);
        }
    }
}
