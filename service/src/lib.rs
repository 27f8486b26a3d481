//! # Taskpilot Service
//!
//! Process wiring for the assistant backend: configuration, telemetry,
//! shared resilience components, background jobs and shutdown.

pub mod app;
pub mod config;
pub mod jobs;
pub mod shutdown;
pub mod telemetry;

pub use app::Services;
pub use config::{ConfigError, Environment, ServiceConfig};
pub use jobs::{ResilienceStatusJob, StatusReport};
pub use shutdown::ShutdownCoordinator;
