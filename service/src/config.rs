//! Service configuration.
//!
//! Defaults depend on the deployment environment (`TASKPILOT_ENV`). An
//! optional TOML file named by `TASKPILOT_CONFIG` overlays them key by key.
//! Secrets are read from the environment only.
//!
//! ```toml
//! [observability]
//! log_level = "debug"
//!
//! [resilience.breakers.telegram_api]
//! failure_threshold = 8
//! call_timeout_secs = 10
//!
//! [resilience.llm_rate_limit]
//! max_requests = 15
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use taskpilot_resilience::{
    Admission, CircuitBreakerConfig, Dependency, RateLimiterConfig, RetryPolicy,
};
use thiserror::Error;

/// Selects the deployment environment.
pub const ENVIRONMENT_VAR: &str = "TASKPILOT_ENV";

/// Path of the optional TOML overlay.
pub const CONFIG_PATH_VAR: &str = "TASKPILOT_CONFIG";

/// Gemini API key.
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(&'static str),

    /// Invalid environment value
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    /// Overlay file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Overlay file is not valid TOML or does not match the schema
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development
    Development,
    /// Pre-production
    Staging,
    /// Production
    Production,
}

impl Environment {
    /// Check if this is production environment
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is development environment
    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidEnvironment(s.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// LLM client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name
    pub model: String,
    /// API root
    pub base_url: String,
    /// Per-request HTTP timeout in seconds
    pub timeout_secs: u64,
    /// API key (from `GEMINI_API_KEY` only)
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl LlmConfig {
    /// Get timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.model.is_empty() {
            return Err(ConfigError::Validation("llm.model cannot be empty".to_string()));
        }
        if self.base_url.is_empty() {
            return Err(ConfigError::Validation("llm.base_url cannot be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation("llm.timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: taskpilot_gemini::client::DEFAULT_MODEL.to_string(),
            base_url: taskpilot_gemini::client::DEFAULT_BASE_URL.to_string(),
            timeout_secs: taskpilot_gemini::client::DEFAULT_TIMEOUT.as_secs(),
            api_key: None,
        }
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub log_level: String,
    /// Emit JSON log lines
    pub json_logs: bool,
    /// Serve Prometheus metrics
    pub metrics_enabled: bool,
    /// Metrics port
    pub metrics_port: u16,
}

impl ObservabilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "invalid log_level: {}. Must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

/// Partial breaker settings; unset fields keep the dependency's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    /// Seconds the circuit stays open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_secs: Option<u64>,
    /// Per-call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
    /// Half-open successes needed to close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
}

impl BreakerSettings {
    /// Apply these settings on top of `base`.
    #[must_use]
    pub fn apply(&self, base: CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            recovery_timeout: self
                .recovery_timeout_secs
                .map_or(base.recovery_timeout, Duration::from_secs),
            call_timeout: self
                .call_timeout_secs
                .map_or(base.call_timeout, Duration::from_secs),
            success_threshold: self.success_threshold.unwrap_or(base.success_threshold),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let zero = [
            ("failure_threshold", self.failure_threshold.map(u64::from)),
            ("recovery_timeout_secs", self.recovery_timeout_secs),
            ("call_timeout_secs", self.call_timeout_secs),
            ("success_threshold", self.success_threshold.map(u64::from)),
        ]
        .into_iter()
        .find(|(_, value)| *value == Some(0));

        match zero {
            Some((field, _)) => Err(ConfigError::Validation(format!(
                "resilience.breakers.{name}.{field} must be > 0"
            ))),
            None => Ok(()),
        }
    }
}

/// LLM rate limit settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests allowed per window
    pub max_requests: usize,
    /// Window length in seconds
    pub window_secs: u64,
    /// Poll interval while waiting for a slot, in milliseconds
    pub poll_interval_ms: u64,
    /// How long a call may wait for a slot; 0 fails fast
    pub max_wait_secs: u64,
}

impl RateLimitSettings {
    /// Limiter configuration
    #[must_use]
    pub const fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new(self.max_requests, Duration::from_secs(self.window_secs))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }

    /// How calls wait for a slot
    #[must_use]
    pub const fn admission(&self) -> Admission {
        if self.max_wait_secs == 0 {
            Admission::FailFast
        } else {
            Admission::Wait(Duration::from_secs(self.max_wait_secs))
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let limit = RateLimiterConfig::new(10, Duration::from_secs(60));
        Self {
            max_requests: limit.max_requests,
            window_secs: limit.window.as_secs(),
            poll_interval_ms: 1000,
            max_wait_secs: 30,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff base in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
}

impl RetrySettings {
    /// Retry policy
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .build()
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

/// Resilience configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-breaker overrides keyed by breaker name
    pub breakers: BTreeMap<String, BreakerSettings>,
    /// LLM rate limit
    pub llm_rate_limit: RateLimitSettings,
    /// Retry policy for external calls
    pub retry: RetrySettings,
}

impl ResilienceConfig {
    /// Full breaker configurations for every overridden name.
    ///
    /// Known dependencies start from their own defaults, unknown names from
    /// [`CircuitBreakerConfig::default`].
    #[must_use]
    pub fn breaker_overrides(&self) -> HashMap<String, CircuitBreakerConfig> {
        self.breakers
            .iter()
            .map(|(name, settings)| {
                let base = Dependency::from_name(name)
                    .map_or_else(CircuitBreakerConfig::default, Dependency::default_breaker_config);
                (name.clone(), settings.apply(base))
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, settings) in &self.breakers {
            settings.validate(name)?;
        }

        let limit = &self.llm_rate_limit;
        if limit.max_requests == 0 || limit.window_secs == 0 || limit.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "resilience.llm_rate_limit: max_requests, window_secs and poll_interval_ms must be > 0"
                    .to_string(),
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "resilience.retry.max_attempts must be > 0".to_string(),
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::Validation(
                "resilience.retry.base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval of the resilience status report, in seconds
    pub status_report_interval_secs: u64,
    /// Wait after a failed run, in seconds
    pub fallback_delay_secs: u64,
    /// Grace period for loops to stop on shutdown, in seconds
    pub shutdown_timeout_secs: u64,
}

impl SchedulerConfig {
    /// Status report interval
    #[must_use]
    pub const fn status_report_interval(&self) -> Duration {
        Duration::from_secs(self.status_report_interval_secs)
    }

    /// Wait after a failed run
    #[must_use]
    pub const fn fallback_delay(&self) -> Duration {
        Duration::from_secs(self.fallback_delay_secs)
    }

    /// Shutdown grace period
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.status_report_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "scheduler.status_report_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            status_report_interval_secs: 300,
            fallback_delay_secs: 3600,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Deployment environment
    pub environment: Environment,
    /// LLM client
    pub llm: LlmConfig,
    /// Logging and metrics
    pub observability: ObservabilityConfig,
    /// Breakers, rate limit and retry
    pub resilience: ResilienceConfig,
    /// Background jobs
    pub scheduler: SchedulerConfig,
}

impl ServiceConfig {
    /// Load configuration from the process environment
    ///
    /// Reads `TASKPILOT_ENV` (defaults to development), the file named by
    /// `TASKPILOT_CONFIG` if set, and `GEMINI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns error if the environment is unknown, the file cannot be read or
    /// parsed, a required secret is missing, or validation fails
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = std::env::var(ENVIRONMENT_VAR)
            .map_or(Ok(Environment::Development), |value| value.parse())?;

        let overlay = match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => {
                let path = PathBuf::from(path);
                let content = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Some(content)
            }
            None => None,
        };

        let api_key = std::env::var(API_KEY_VAR).ok().filter(|key| !key.is_empty());

        Self::load(environment, overlay.as_deref(), api_key)
    }

    /// Load configuration for `environment`, overlaying `overlay` (TOML text)
    ///
    /// # Errors
    ///
    /// Returns error if the overlay is invalid, the API key is required but
    /// missing, or validation fails
    pub fn load(
        environment: Environment,
        overlay: Option<&str>,
        api_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::for_environment(environment);
        if let Some(overlay) = overlay {
            config = config.overlay(overlay)?;
            config.environment = environment;
        }

        config.llm.api_key = api_key;
        if config.llm.api_key.is_none() && !environment.is_development() {
            return Err(ConfigError::EnvVarNotSet(API_KEY_VAR));
        }

        config.validate()?;
        Ok(config)
    }

    /// Defaults for `environment`
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            llm: LlmConfig::default(),
            observability: ObservabilityConfig::default(),
            resilience: ResilienceConfig::default(),
            scheduler: SchedulerConfig::default(),
        };

        match environment {
            Environment::Development => {
                config.observability.log_level = "debug".to_string();
                config.scheduler.status_report_interval_secs = 60;
                config.scheduler.fallback_delay_secs = 60;
            }
            Environment::Staging => {
                config.observability.json_logs = true;
                config.observability.metrics_enabled = true;
            }
            Environment::Production => {
                config.observability.json_logs = true;
                config.observability.metrics_enabled = true;
                config.scheduler.status_report_interval_secs = 900;
            }
        }

        config
    }

    fn overlay(&self, overlay: &str) -> Result<Self, ConfigError> {
        let overlay: toml::Table = overlay
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;

        let mut base = match toml::Value::try_from(self) {
            Ok(toml::Value::Table(table)) => table,
            Ok(_) => return Err(ConfigError::Parse("configuration is not a table".to_string())),
            Err(e) => return Err(ConfigError::Parse(e.to_string())),
        };
        merge_tables(&mut base, overlay);

        let mut merged: Self = toml::Value::Table(base)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
        merged.llm.api_key.clone_from(&self.llm.api_key);
        Ok(merged)
    }

    /// Validate entire configuration
    ///
    /// # Errors
    ///
    /// Returns error if any configuration section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.llm.validate()?;
        self.observability.validate()?;
        self.resilience.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(overlay_table) = value {
            if let Some(toml::Value::Table(base_table)) = base.get_mut(&key) {
                merge_tables(base_table, overlay_table);
                continue;
            }
            base.insert(key, toml::Value::Table(overlay_table));
        } else {
            base.insert(key, value);
        }
    }
}
