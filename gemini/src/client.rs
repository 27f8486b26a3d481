//! Gemini API client implementation

use crate::error::GeminiError;
use crate::types::{GenerateContentRequest, GenerateContentResponse};
use reqwest::Client;
use std::time::Duration;

/// Default API root
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro-latest";

/// Per-request HTTP timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gemini API client
///
/// Performs exactly one HTTP request per call. Retries, rate limiting and
/// circuit breaking belong to the caller (see [`crate::TaskAnalyzer`]).
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("has_api_key", &self.has_api_key())
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    /// Create a new client with API key from environment
    ///
    /// # Errors
    ///
    /// Returns `GeminiError::MissingApiKey` if `GEMINI_API_KEY` is not set
    pub fn from_env() -> Result<Self, GeminiError> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| GeminiError::MissingApiKey)?;
        Ok(Self::new(api_key))
    }

    /// Create a new client with explicit API key
    ///
    /// An empty key is accepted; every request then fails with
    /// [`GeminiError::MissingApiKey`] without touching the network.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Point the client at another API root (tests, proxies)
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use another model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the per-request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether an API key is configured
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Model name
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    /// Send one `generateContent` request
    ///
    /// # Errors
    ///
    /// - [`GeminiError::MissingApiKey`] when no key is configured
    /// - [`GeminiError::Timeout`] / [`GeminiError::Transport`] for network failures
    /// - [`GeminiError::Status`] for non-success responses
    /// - [`GeminiError::ResponseParseFailed`] when the body is not valid JSON
    pub async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GeminiError> {
        if !self.has_api_key() {
            return Err(GeminiError::MissingApiKey);
        }

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), "Gemini API returned error status");
            return Err(GeminiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<GenerateContentResponse>().await.map_err(|e| {
            if e.is_timeout() {
                GeminiError::Timeout
            } else {
                GeminiError::ResponseParseFailed(e.to_string())
            }
        })
    }
}

fn transport_error(err: reqwest::Error) -> GeminiError {
    if err.is_timeout() {
        GeminiError::Timeout
    } else {
        GeminiError::Transport(err.to_string())
    }
}
