//! # Taskpilot Gemini
//!
//! Client for the Gemini `generateContent` API and the task analyzer built
//! on it.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskpilot_gemini::{GeminiClient, TaskAnalyzer};
//! use taskpilot_resilience::{
//!     Admission, CircuitBreakerRegistry, Dependency, RateLimiter, RetryPolicy,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CircuitBreakerRegistry::new();
//! let limit = Dependency::LlmAnalysis
//!     .default_rate_limit()
//!     .ok_or("llm has a rate limit")?;
//! let limiter = Arc::new(RateLimiter::new(Dependency::LlmAnalysis.name(), limit));
//!
//! let analyzer = TaskAnalyzer::from_registry(
//!     GeminiClient::from_env()?,
//!     &registry,
//!     RetryPolicy::default(),
//!     limiter,
//!     Admission::Wait(Duration::from_secs(30)),
//! );
//!
//! let result = analyzer.analyze_or_fallback("Send the Q3 report by Friday", "telegram").await;
//! println!("{} tasks", result.tasks.len());
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod analyzer;
pub mod client;
pub mod error;
pub mod types;

pub use analysis::{AnalysisResult, Priority, TaskData, build_prompt, parse_analysis};
pub use analyzer::TaskAnalyzer;
pub use client::GeminiClient;
pub use error::{AnalyzeError, GeminiError};
pub use types::{GenerateContentRequest, GenerateContentResponse};
