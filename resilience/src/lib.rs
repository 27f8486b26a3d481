//! # Taskpilot Resilience
//!
//! Failure isolation and admission control for the assistant's calls to
//! unreliable external services (LLM analysis, messaging, mail, calendar).
//!
//! ## Core Components
//!
//! - **Circuit breaker**: three-state guard around one named dependency
//! - **Registry**: one shared breaker per dependency name, created lazily
//! - **Rate limiter**: sliding-window admission gate per provider quota
//! - **Retry**: exponential backoff driven by error classification
//! - **Resilient client**: rate limit, then breaker, then retry loop
//! - **Scheduler**: background loops that outlive failing jobs
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskpilot_resilience::client::{Admission, ResilientClient};
//! use taskpilot_resilience::dependency::Dependency;
//! use taskpilot_resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use taskpilot_resilience::registry::CircuitBreakerRegistry;
//! use taskpilot_resilience::retry::RetryPolicy;
//!
//! let registry = CircuitBreakerRegistry::new();
//! let limiter = Arc::new(RateLimiter::new(
//!     Dependency::LlmAnalysis.name(),
//!     RateLimiterConfig::new(10, Duration::from_secs(60)),
//! ));
//!
//! let client = ResilientClient::new(
//!     registry.for_dependency(Dependency::LlmAnalysis),
//!     RetryPolicy::default(),
//! )
//! .with_rate_limiter(limiter, Admission::Wait(Duration::from_secs(30)));
//! # let _ = client;
//! ```

/// Circuit breaker state machine
pub mod circuit_breaker;

/// Keyed store of shared circuit breakers
pub mod registry;

/// Sliding-window rate limiting
pub mod rate_limiter;

/// Retry with exponential backoff
pub mod retry;

/// Rate limit + breaker + retry composition
pub mod client;

/// Known external dependencies and their default policies
pub mod dependency;

/// Recurring background jobs
pub mod scheduler;

/// Wall-clock abstraction
pub mod clock;

/// Prometheus metrics for observability
pub mod metrics;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitError, CircuitOpenError,
    CircuitState, CircuitTimeoutError, Failure,
};
pub use client::{Admission, CallError, ResilientClient};
pub use dependency::Dependency;
pub use rate_limiter::{RateLimitExceeded, RateLimiter, RateLimiterConfig, RateLimiterStatus};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryError, RetryPolicy, Retryable, is_retryable_status};
