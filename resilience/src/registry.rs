//! Process-wide store of circuit breakers, one per dependency name.
//!
//! The registry is constructed once at startup and handed by reference to
//! every component that issues external calls. Breakers are created lazily on
//! first lookup and never removed; callers only ever hold an `Arc` obtained
//! from a lookup.
//!
//! ```rust
//! use taskpilot_resilience::dependency::Dependency;
//! use taskpilot_resilience::registry::CircuitBreakerRegistry;
//! use std::sync::Arc;
//!
//! let registry = CircuitBreakerRegistry::new();
//! let a = registry.for_dependency(Dependency::LlmAnalysis);
//! let b = registry.get_or_create("gemini_api", None);
//! assert!(Arc::ptr_eq(&a, &b));
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::dependency::Dependency;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Keyed store handing out shared circuit breakers.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    overrides: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry whose named breakers use the given configurations
    /// instead of what callers pass on first lookup.
    #[must_use]
    pub fn with_overrides(overrides: HashMap<String, CircuitBreakerConfig>) -> Self {
        Self {
            breakers: RwLock::default(),
            overrides,
        }
    }

    /// Look up a breaker, creating it on first access.
    ///
    /// The configuration is only used when the breaker does not exist yet; a
    /// registry override for `name` takes precedence, then `config`, then
    /// [`CircuitBreakerConfig::default`]. Concurrent first lookups of the same
    /// name all receive the same instance.
    pub fn get_or_create(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another task may have inserted between the read and write locks.
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(name)
                .copied()
                .or(config)
                .unwrap_or_default();
            tracing::debug!(circuit = name, "Registering circuit breaker");
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(breaker)
    }

    /// Breaker for a known dependency, using its default configuration.
    pub fn for_dependency(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        self.get_or_create(dependency.name(), Some(dependency.default_breaker_config()))
    }

    /// Look up a breaker without creating it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.read().get(name).cloned()
    }

    /// Stats of every registered breaker, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Force every breaker back to Closed.
    pub fn reset_all(&self) {
        for breaker in self.read().values() {
            breaker.reset();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_lazy_creation_with_default_config() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("unknown").is_none());

        let breaker = registry.get_or_create("custom", None);
        assert_eq!(*breaker.config(), CircuitBreakerConfig::default());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_first_config_wins() {
        let registry = CircuitBreakerRegistry::new();
        let first = CircuitBreakerConfig::builder().failure_threshold(7).build();
        let second = CircuitBreakerConfig::builder().failure_threshold(2).build();

        let a = registry.get_or_create("svc", Some(first));
        let b = registry.get_or_create("svc", Some(second));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 7);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let override_config = CircuitBreakerConfig::builder()
            .failure_threshold(10)
            .recovery_timeout(Duration::from_secs(5))
            .build();
        let registry = CircuitBreakerRegistry::with_overrides(HashMap::from([(
            "gemini_api".to_string(),
            override_config,
        )]));

        let breaker = registry.for_dependency(Dependency::LlmAnalysis);
        assert_eq!(*breaker.config(), override_config);

        let mail = registry.for_dependency(Dependency::Mail);
        assert_eq!(*mail.config(), Dependency::Mail.default_breaker_config());
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let registry = CircuitBreakerRegistry::new();
        for dep in Dependency::ALL {
            registry.for_dependency(dep);
        }

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["calendar_api", "gemini_api", "gmail_api", "telegram_api"]
        );
        assert_eq!(registry.names(), names);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig::builder().failure_threshold(1).build();
        let breaker = registry.get_or_create("flaky", Some(config));
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
