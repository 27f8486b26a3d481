//! Forwarding of push notifications to the assistant backend.
//!
//! The backend may be asleep when a notification arrives. The first request
//! then either takes a long time (the backend boots while serving it) or
//! fails with 503 until it is up. Both cases are handled here: slow
//! responses are flagged as cold starts, and 429/503/5xx are retried with
//! exponential backoff. Any other 4xx ends forwarding immediately.

use crate::error::ForwardError;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use taskpilot_resilience::clock::{Clock, SystemClock};
use taskpilot_resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, ResilientClient, RetryPolicy,
};
use tokio::time::Instant;

/// Breaker name for the backend the notifications are forwarded to
pub const BREAKER_NAME: &str = "webhook_backend";

/// Per-request HTTP timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Responses slower than this are reported as cold starts
pub const COLD_START_THRESHOLD: Duration = Duration::from_secs(10);

/// Headers copied from the incoming notification when present.
const PASSTHROUGH_HEADERS: [&str; 7] = [
    "authorization",
    "x-goog-channel-id",
    "x-goog-channel-token",
    "x-goog-message-number",
    "x-goog-resource-id",
    "x-goog-resource-state",
    "x-goog-resource-uri",
];

/// Source of a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    /// Mail push notification
    Gmail,
    /// Calendar channel notification
    Calendar,
}

impl WebhookKind {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Calendar => "calendar",
        }
    }

    /// Backend path the notification is delivered to.
    #[must_use]
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Gmail => "/api/v1/webhook/gmail",
            Self::Calendar => "/api/v1/webhook/calendar",
        }
    }

    const fn user_agent(self) -> &'static str {
        match self {
            Self::Gmail => "Gmail-Webhook-Proxy/1.0",
            Self::Calendar => "Calendar-Webhook-Proxy/1.0",
        }
    }
}

impl fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Headers sent to the backend for a notification of `kind` received with
/// `incoming` headers at `now`.
#[must_use]
pub fn forwarded_headers(kind: WebhookKind, incoming: &HeaderMap, now: DateTime<Utc>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(kind.user_agent()));
    headers.insert(
        HeaderName::from_static("x-forwarded-for"),
        incoming
            .get("x-forwarded-for")
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("")),
    );
    headers.insert(
        HeaderName::from_static("x-proxy-timestamp"),
        HeaderValue::from(now.timestamp()),
    );

    for name in PASSTHROUGH_HEADERS {
        if let Some(value) = incoming.get(name) {
            headers.insert(HeaderName::from_static(name), value.clone());
        }
    }
    headers
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardSuccess {
    /// Backend status code
    pub status_code: u16,
    /// Duration of the successful attempt, in seconds
    pub response_time_secs: f64,
    /// Whether the successful attempt exceeded the cold start threshold
    pub is_cold_start: bool,
    /// 1-based attempt that succeeded
    pub attempt: u32,
    /// Backend response body; `{}` when empty, a string when not JSON
    pub response_data: Value,
}

/// A notification that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardFailure {
    /// Final error
    pub error: String,
    /// Attempts actually made (0 when the circuit refused the call)
    pub attempts: u32,
    /// Target URL
    pub url: String,
}

/// Result of forwarding one notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForwardOutcome {
    /// Delivered
    Success(ForwardSuccess),
    /// Gave up
    Failed(ForwardFailure),
}

impl ForwardOutcome {
    /// Whether the notification was delivered.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Status to answer the notification sender with.
    ///
    /// 502 tells the sender to redeliver later.
    #[must_use]
    pub const fn reply_status(&self) -> u16 {
        match self {
            Self::Success(_) => 200,
            Self::Failed(_) => 502,
        }
    }
}

/// Forwards notifications to the backend through the resilience layer.
#[derive(Clone)]
pub struct WebhookForwarder {
    client: Client,
    base_url: String,
    timeout: Duration,
    cold_start_threshold: Duration,
    resilient: ResilientClient,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for WebhookForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookForwarder")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("cold_start_threshold", &self.cold_start_threshold)
            .field("resilient", &self.resilient)
            .finish_non_exhaustive()
    }
}

impl WebhookForwarder {
    /// Breaker settings for the backend.
    ///
    /// The call timeout bounds the whole retry loop, so it covers five
    /// request timeouts plus the backoff between them.
    #[must_use]
    pub const fn default_breaker_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(240),
            success_threshold: 2,
        }
    }

    /// Five attempts, waiting 2s, 4s, 8s and 16s between them.
    #[must_use]
    pub fn default_retry_policy() -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(60))
            .build()
    }

    /// Forwarder over an already composed resilient client.
    #[must_use]
    pub fn new(base_url: impl Into<String>, resilient: ResilientClient) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            cold_start_threshold: COLD_START_THRESHOLD,
            resilient,
            clock: Arc::new(SystemClock),
        }
    }

    /// Forwarder guarded by the registry's `webhook_backend` breaker.
    #[must_use]
    pub fn from_registry(
        base_url: impl Into<String>,
        registry: &CircuitBreakerRegistry,
        retry: RetryPolicy,
    ) -> Self {
        let breaker = registry.get_or_create(BREAKER_NAME, Some(Self::default_breaker_config()));
        Self::new(base_url, ResilientClient::new(breaker, retry))
    }

    /// Override the per-request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the cold start threshold
    #[must_use]
    pub const fn with_cold_start_threshold(mut self, threshold: Duration) -> Self {
        self.cold_start_threshold = threshold;
        self
    }

    /// Use `clock` for the proxy timestamp header.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The resilient client carrying the breaker.
    #[must_use]
    pub const fn resilient(&self) -> &ResilientClient {
        &self.resilient
    }

    /// Target URL for `kind`.
    #[must_use]
    pub fn url(&self, kind: WebhookKind) -> String {
        format!("{}{}", self.base_url, kind.endpoint())
    }

    /// Forward `payload` to the backend endpoint for `kind`.
    ///
    /// Never fails; the outcome says whether the notification was delivered.
    pub async fn forward(
        &self,
        kind: WebhookKind,
        payload: &Value,
        incoming: &HeaderMap,
    ) -> ForwardOutcome {
        let url = self.url(kind);
        let headers = forwarded_headers(kind, incoming, self.clock.now());
        tracing::info!(
            webhook = %kind,
            payload_size = payload.to_string().len(),
            headers_count = headers.len(),
            "Processing webhook"
        );

        let attempts = AtomicU32::new(0);
        let result = self
            .resilient
            .execute("forward_webhook", Some(kind.as_str()), || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                self.post_once(&url, payload, &headers, attempt)
            })
            .await;

        match result {
            Ok(success) => ForwardOutcome::Success(success),
            Err(err) => {
                let attempts = attempts.load(Ordering::Relaxed);
                tracing::error!(
                    webhook = %kind,
                    attempts,
                    error = %err,
                    url = %url,
                    "All webhook forward attempts failed"
                );
                ForwardOutcome::Failed(ForwardFailure {
                    error: err.to_string(),
                    attempts,
                    url,
                })
            }
        }
    }

    async fn post_once(
        &self,
        url: &str,
        payload: &Value,
        headers: &HeaderMap,
        attempt: u32,
    ) -> Result<ForwardSuccess, ForwardError> {
        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .headers(headers.clone())
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        let response_time = started.elapsed();
        let is_cold_start = response_time > self.cold_start_threshold;

        tracing::info!(
            attempt,
            status_code = status.as_u16(),
            response_time_secs = response_time.as_secs_f64(),
            is_cold_start,
            url,
            "Webhook forwarded"
        );

        if !status.is_success() {
            return Err(ForwardError::Status {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(ForwardSuccess {
            status_code: status.as_u16(),
            response_time_secs: response_time.as_secs_f64(),
            is_cold_start,
            attempt,
            response_data: response_data(body),
        })
    }
}

fn response_data(body: String) -> Value {
    if body.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body))
}

fn transport_error(err: reqwest::Error) -> ForwardError {
    if err.is_timeout() {
        ForwardError::Timeout
    } else {
        ForwardError::Transport(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use serde_json::json;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_forwarded_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert("x-goog-channel-id", HeaderValue::from_static("channel-1"));
        incoming.insert("x-goog-resource-state", HeaderValue::from_static("exists"));
        incoming.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        incoming.insert("cookie", HeaderValue::from_static("session=abc"));

        let headers = forwarded_headers(WebhookKind::Calendar, &incoming, at("2025-01-01T00:00:00Z"));

        assert_eq!(headers["user-agent"], "Calendar-Webhook-Proxy/1.0");
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1");
        assert_eq!(headers["x-proxy-timestamp"], "1735689600");
        assert_eq!(headers["x-goog-channel-id"], "channel-1");
        assert_eq!(headers["x-goog-resource-state"], "exists");
        assert!(headers.get("cookie").is_none());
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn test_missing_forwarded_for_is_blank() {
        let headers = forwarded_headers(WebhookKind::Gmail, &HeaderMap::new(), Utc::now());
        assert_eq!(headers["x-forwarded-for"], "");
        assert_eq!(headers["user-agent"], "Gmail-Webhook-Proxy/1.0");
    }

    #[test]
    fn test_url_and_defaults() {
        let registry = CircuitBreakerRegistry::new();
        let forwarder = WebhookForwarder::from_registry(
            "https://backend.local/",
            &registry,
            WebhookForwarder::default_retry_policy(),
        );

        assert_eq!(forwarder.url(WebhookKind::Gmail), "https://backend.local/api/v1/webhook/gmail");
        assert_eq!(
            forwarder.url(WebhookKind::Calendar),
            "https://backend.local/api/v1/webhook/calendar"
        );
        assert_eq!(forwarder.timeout, DEFAULT_TIMEOUT);
        assert_eq!(forwarder.cold_start_threshold, COLD_START_THRESHOLD);

        let breaker = registry.get(BREAKER_NAME).unwrap();
        assert_eq!(breaker.config().call_timeout, Duration::from_secs(240));
        let policy = forwarder.resilient().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        let waits: Vec<_> = (1..5).map(|i| policy.backoff_for(i).as_secs()).collect();
        assert_eq!(waits, vec![2, 4, 8, 16]);
    }

    #[test]
    fn test_response_data() {
        assert_eq!(response_data(String::new()), json!({}));
        assert_eq!(response_data(r#"{"queued": 2}"#.to_string()), json!({"queued": 2}));
        assert_eq!(response_data("accepted".to_string()), json!("accepted"));
    }

    #[test]
    fn test_outcome_serialization() {
        let failed = ForwardOutcome::Failed(ForwardFailure {
            error: "boom".to_string(),
            attempts: 5,
            url: "http://x/api/v1/webhook/gmail".to_string(),
        });
        assert_eq!(failed.reply_status(), 502);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["attempts"], 5);
    }
}
