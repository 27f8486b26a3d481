//! Recurring jobs run by the service.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use taskpilot_resilience::scheduler::ScheduledJob;
use taskpilot_resilience::{
    CircuitBreakerRegistry, CircuitBreakerStats, CircuitState, RateLimiter, RateLimiterStatus,
};
use tracing::{info, warn};

/// Health of every breaker and limiter at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Breaker stats, sorted by name
    pub breakers: Vec<CircuitBreakerStats>,
    /// Limiter status
    pub rate_limiters: Vec<RateLimiterStatus>,
}

impl StatusReport {
    /// Names of breakers that are not closed.
    #[must_use]
    pub fn degraded(&self) -> Vec<&str> {
        self.breakers
            .iter()
            .filter(|stats| stats.state != CircuitState::Closed)
            .map(|stats| stats.name.as_str())
            .collect()
    }
}

/// Logs the registry snapshot and limiter status.
#[derive(Debug)]
pub struct ResilienceStatusJob {
    registry: Arc<CircuitBreakerRegistry>,
    limiters: Vec<Arc<RateLimiter>>,
}

impl ResilienceStatusJob {
    /// Job reporting on `registry` and `limiters`.
    #[must_use]
    pub const fn new(registry: Arc<CircuitBreakerRegistry>, limiters: Vec<Arc<RateLimiter>>) -> Self {
        Self { registry, limiters }
    }

    /// Collect the current report.
    #[must_use]
    pub fn report(&self) -> StatusReport {
        StatusReport {
            breakers: self.registry.snapshot(),
            rate_limiters: self.limiters.iter().map(|limiter| limiter.status()).collect(),
        }
    }
}

#[async_trait]
impl ScheduledJob for ResilienceStatusJob {
    fn name(&self) -> &str {
        "resilience_status"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let report = self.report();

        for stats in &report.breakers {
            if stats.state == CircuitState::Closed {
                info!(
                    circuit = %stats.name,
                    total_calls = stats.total_calls,
                    success_rate = stats.success_rate,
                    "Circuit healthy"
                );
            } else {
                warn!(
                    circuit = %stats.name,
                    state = stats.state.as_str(),
                    failure_count = stats.failure_count,
                    total_rejections = stats.total_rejections,
                    "Circuit degraded"
                );
            }
        }

        for status in &report.rate_limiters {
            info!(
                limiter = %status.name,
                current = status.current_count,
                available = status.available_slots,
                "Rate limiter usage"
            );
        }

        tracing::debug!(report = %serde_json::to_string(&report)?, "Resilience status");
        Ok(())
    }
}
