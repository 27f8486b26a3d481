//! The external services the assistant talks to, with their default policies.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limiter::RateLimiterConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// An external dependency guarded by its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// LLM task analysis (Gemini)
    LlmAnalysis,
    /// Chat messaging (Telegram)
    Messaging,
    /// Mail (Gmail)
    Mail,
    /// Calendar
    Calendar,
}

impl Dependency {
    /// Every dependency, in registration order.
    pub const ALL: [Self; 4] = [Self::LlmAnalysis, Self::Messaging, Self::Mail, Self::Calendar];

    /// Breaker name used as the registry key and in logs and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LlmAnalysis => "gemini_api",
            Self::Messaging => "telegram_api",
            Self::Mail => "gmail_api",
            Self::Calendar => "calendar_api",
        }
    }

    /// Look up a dependency by its breaker name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|dep| dep.name() == name)
    }

    /// Breaker settings tuned for this dependency.
    #[must_use]
    pub const fn default_breaker_config(self) -> CircuitBreakerConfig {
        let (failure_threshold, recovery_secs, call_timeout_secs, success_threshold) = match self {
            Self::LlmAnalysis => (3, 30, 30, 2),
            Self::Messaging => (5, 60, 15, 3),
            Self::Mail | Self::Calendar => (3, 120, 30, 2),
        };
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
            call_timeout: Duration::from_secs(call_timeout_secs),
            success_threshold,
        }
    }

    /// Outbound rate limit, if the provider enforces a quota we must respect.
    #[must_use]
    pub const fn default_rate_limit(self) -> Option<RateLimiterConfig> {
        match self {
            Self::LlmAnalysis => Some(RateLimiterConfig::new(10, Duration::from_secs(60))),
            Self::Messaging | Self::Mail | Self::Calendar => None,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let llm = Dependency::LlmAnalysis.default_breaker_config();
        assert_eq!(llm.failure_threshold, 3);
        assert_eq!(llm.recovery_timeout, Duration::from_secs(30));
        assert_eq!(llm.call_timeout, Duration::from_secs(30));
        assert_eq!(llm.success_threshold, 2);

        let messaging = Dependency::Messaging.default_breaker_config();
        assert_eq!(messaging.failure_threshold, 5);
        assert_eq!(messaging.recovery_timeout, Duration::from_secs(60));
        assert_eq!(messaging.call_timeout, Duration::from_secs(15));
        assert_eq!(messaging.success_threshold, 3);

        for dep in [Dependency::Mail, Dependency::Calendar] {
            let config = dep.default_breaker_config();
            assert_eq!(config.failure_threshold, 3);
            assert_eq!(config.recovery_timeout, Duration::from_secs(120));
            assert_eq!(config.call_timeout, Duration::from_secs(30));
            assert_eq!(config.success_threshold, 2);
        }
    }

    #[test]
    fn test_only_llm_is_rate_limited() {
        let limit = Dependency::LlmAnalysis.default_rate_limit();
        assert_eq!(limit.map(|l| (l.max_requests, l.window)), Some((10, Duration::from_secs(60))));
        assert!(Dependency::Messaging.default_rate_limit().is_none());
        assert!(Dependency::Mail.default_rate_limit().is_none());
        assert!(Dependency::Calendar.default_rate_limit().is_none());
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = Dependency::ALL.iter().map(|d| d.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Dependency::ALL.len());
        assert_eq!(Dependency::Calendar.to_string(), "calendar_api");
    }

    #[test]
    fn test_from_name() {
        for dep in Dependency::ALL {
            assert_eq!(Dependency::from_name(dep.name()), Some(dep));
        }
        assert_eq!(Dependency::from_name("slack_api"), None);
    }
}
