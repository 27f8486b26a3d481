//! Construction of the shared resilience components from configuration.

use crate::config::ServiceConfig;
use std::sync::Arc;
use taskpilot_gemini::{GeminiClient, TaskAnalyzer};
use taskpilot_resilience::{CircuitBreakerRegistry, Dependency, RateLimiter};
use tracing::{info, warn};

/// Components shared by every part of the service.
///
/// Built once at startup and passed explicitly to whatever needs them.
#[derive(Debug, Clone)]
pub struct Services {
    /// Breakers for every external dependency
    pub registry: Arc<CircuitBreakerRegistry>,
    /// Outbound limiter for the LLM API
    pub llm_limiter: Arc<RateLimiter>,
    /// LLM task analyzer
    pub analyzer: TaskAnalyzer,
}

impl Services {
    /// Build the registry, limiter and analyzer described by `config`.
    ///
    /// Every known dependency's breaker is registered up front so status
    /// reports list them before their first call.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let registry = Arc::new(CircuitBreakerRegistry::with_overrides(
            config.resilience.breaker_overrides(),
        ));
        for dependency in Dependency::ALL {
            let breaker = registry.for_dependency(dependency);
            info!(
                circuit = %breaker.name(),
                failure_threshold = breaker.config().failure_threshold,
                recovery_timeout_secs = breaker.config().recovery_timeout.as_secs(),
                "Circuit breaker registered"
            );
        }

        let limits = &config.resilience.llm_rate_limit;
        let llm_limiter = Arc::new(RateLimiter::new(
            Dependency::LlmAnalysis.name(),
            limits.limiter_config(),
        ));

        let api_key = config.llm.api_key.clone().unwrap_or_default();
        if api_key.is_empty() {
            warn!("GEMINI_API_KEY not set, LLM analysis will use the fallback");
        }
        let client = GeminiClient::new(api_key)
            .with_base_url(config.llm.base_url.as_str())
            .with_model(config.llm.model.as_str())
            .with_timeout(config.llm.timeout());

        let analyzer = TaskAnalyzer::from_registry(
            client,
            &registry,
            config.resilience.retry.policy(),
            Arc::clone(&llm_limiter),
            limits.admission(),
        );

        Self {
            registry,
            llm_limiter,
            analyzer,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::config::{BreakerSettings, Environment};
    use std::time::Duration;
    use taskpilot_resilience::Admission;

    #[test]
    fn test_registers_every_dependency_with_overrides() {
        let mut config = ServiceConfig::for_environment(Environment::Development);
        config.resilience.breakers.insert(
            "gemini_api".to_string(),
            BreakerSettings {
                failure_threshold: Some(7),
                ..BreakerSettings::default()
            },
        );

        let services = Services::from_config(&config);

        assert_eq!(
            services.registry.names(),
            vec!["calendar_api", "gemini_api", "gmail_api", "telegram_api"]
        );
        let llm = services.registry.get("gemini_api").unwrap();
        assert_eq!(llm.config().failure_threshold, 7);
        assert_eq!(llm.config().recovery_timeout, Duration::from_secs(30));

        let resilient = services.analyzer.resilient();
        assert!(Arc::ptr_eq(resilient.breaker(), &llm));
        assert!(Arc::ptr_eq(resilient.rate_limiter().unwrap(), &services.llm_limiter));
        assert_eq!(resilient.retry_policy().max_attempts, 3);
        assert_eq!(services.llm_limiter.config().max_requests, 10);
        assert_eq!(
            config.resilience.llm_rate_limit.admission(),
            Admission::Wait(Duration::from_secs(30))
        );
    }
}
