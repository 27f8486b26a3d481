//! Error types for the Gemini API client

use taskpilot_resilience::client::CallError;
use taskpilot_resilience::retry::{Retryable, is_retryable_status};
use thiserror::Error;

/// Errors that can occur when interacting with the Gemini API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeminiError {
    /// No API key configured
    #[error("Missing GEMINI_API_KEY environment variable")]
    MissingApiKey,

    /// Request or response body exceeded the HTTP timeout
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure
    #[error("Request failed: {0}")]
    Transport(String),

    /// API returned a non-success status
    #[error("API error (status {status}): {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// Response body was not the expected JSON
    #[error("Response parsing failed: {0}")]
    ResponseParseFailed(String),

    /// Response carried no candidate text
    #[error("Empty response: {0}")]
    EmptyResponse(&'static str),
}

impl Retryable for GeminiError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::MissingApiKey | Self::ResponseParseFailed(_) | Self::EmptyResponse(_) => false,
        }
    }

    fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::MissingApiKey | Self::ResponseParseFailed(_))
    }
}

/// Failure of a full analysis call.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// The resilient call did not produce a response
    #[error(transparent)]
    Call(#[from] CallError<GeminiError>),

    /// A response arrived but carried nothing to analyze
    #[error(transparent)]
    Response(GeminiError),
}

impl AnalyzeError {
    /// Whether the resilience layer refused the call (circuit open, rate limited).
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        matches!(self, Self::Call(err) if err.is_saturated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(GeminiError::Timeout.is_retryable());
        assert!(GeminiError::Transport("reset".into()).is_retryable());
        assert!(GeminiError::Status { status: 429, message: String::new() }.is_retryable());
        assert!(GeminiError::Status { status: 503, message: String::new() }.is_retryable());
        assert!(!GeminiError::Status { status: 400, message: String::new() }.is_retryable());
        assert!(!GeminiError::MissingApiKey.is_retryable());

        assert!(!GeminiError::MissingApiKey.counts_against_breaker());
        assert!(!GeminiError::ResponseParseFailed("eof".into()).counts_against_breaker());
        assert!(GeminiError::Status { status: 404, message: String::new() }.counts_against_breaker());
    }
}
