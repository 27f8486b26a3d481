//! Error types for webhook forwarding

use taskpilot_resilience::retry::{Retryable, is_retryable_status};
use thiserror::Error;

/// Failure of a single forwarding attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    /// Backend did not answer within the request timeout
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure
    #[error("Request failed: {0}")]
    Transport(String),

    /// Backend returned a non-success status
    #[error("Backend error (status {status}): {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },
}

impl ForwardError {
    /// HTTP status, when the backend answered.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Timeout | Self::Transport(_) => None,
        }
    }
}

impl Retryable for ForwardError {
    // A sleeping backend answers 503 while it boots, so that one is retried too.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> ForwardError {
        ForwardError::Status {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_classification() {
        assert!(ForwardError::Timeout.is_retryable());
        assert!(ForwardError::Transport("connection refused".into()).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(500).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(401).is_retryable());

        assert!(status(404).counts_against_breaker());
        assert_eq!(status(502).status(), Some(502));
        assert_eq!(ForwardError::Timeout.status(), None);
    }
}
