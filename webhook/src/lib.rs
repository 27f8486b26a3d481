//! # Taskpilot Webhook
//!
//! Relays mail and calendar push notifications to the assistant backend.
//! Slow first responses are flagged as cold starts, and rate-limit,
//! unavailable and server errors are retried with exponential backoff behind
//! the `webhook_backend` circuit breaker.
//!
//! ## Example
//!
//! ```no_run
//! use reqwest::header::HeaderMap;
//! use serde_json::json;
//! use taskpilot_resilience::CircuitBreakerRegistry;
//! use taskpilot_webhook::{WebhookForwarder, WebhookKind};
//!
//! # async fn example() {
//! let registry = CircuitBreakerRegistry::new();
//! let forwarder = WebhookForwarder::from_registry(
//!     "https://assistant.example.com",
//!     &registry,
//!     WebhookForwarder::default_retry_policy(),
//! );
//!
//! let outcome = forwarder
//!     .forward(WebhookKind::Gmail, &json!({"message": {"data": "..."}}), &HeaderMap::new())
//!     .await;
//! println!("reply with {}", outcome.reply_status());
//! # }
//! ```

pub mod error;
pub mod forwarder;

pub use error::ForwardError;
pub use forwarder::{
    ForwardFailure, ForwardOutcome, ForwardSuccess, WebhookForwarder, WebhookKind,
    forwarded_headers,
};
