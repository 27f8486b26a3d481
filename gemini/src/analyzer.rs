//! Task analysis routed through the resilience layer.

use crate::analysis::{AnalysisResult, build_prompt, parse_analysis};
use crate::client::GeminiClient;
use crate::error::AnalyzeError;
use crate::types::GenerateContentRequest;
use std::sync::Arc;
use taskpilot_resilience::clock::{Clock, SystemClock};
use taskpilot_resilience::{
    Admission, CircuitBreakerRegistry, Dependency, RateLimiter, ResilientClient, RetryPolicy,
};

/// Extracts tasks from free text with the LLM.
///
/// Every request goes through the `gemini_api` breaker and, when configured,
/// the LLM rate limiter.
#[derive(Clone)]
pub struct TaskAnalyzer {
    client: GeminiClient,
    resilient: ResilientClient,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TaskAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskAnalyzer")
            .field("client", &self.client)
            .field("resilient", &self.resilient)
            .finish_non_exhaustive()
    }
}

impl TaskAnalyzer {
    /// Analyzer over an already composed resilient client.
    #[must_use]
    pub fn new(client: GeminiClient, resilient: ResilientClient) -> Self {
        Self {
            client,
            resilient,
            clock: Arc::new(SystemClock),
        }
    }

    /// Analyzer wired to the registry's LLM breaker and `limiter`.
    #[must_use]
    pub fn from_registry(
        client: GeminiClient,
        registry: &CircuitBreakerRegistry,
        retry: RetryPolicy,
        limiter: Arc<RateLimiter>,
        admission: Admission,
    ) -> Self {
        let resilient = ResilientClient::new(registry.for_dependency(Dependency::LlmAnalysis), retry)
            .with_rate_limiter(limiter, admission);
        Self::new(client, resilient)
    }

    /// Use `clock` for the "current time" given to the model.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The resilient client carrying the breaker and limiter.
    #[must_use]
    pub const fn resilient(&self) -> &ResilientClient {
        &self.resilient
    }

    /// Analyze `text` received from `source`.
    ///
    /// # Errors
    ///
    /// - [`AnalyzeError::Call`] when the call was refused, timed out, or failed
    ///   after retrying
    /// - [`AnalyzeError::Response`] when the model returned no text
    pub async fn analyze_text(&self, text: &str, source: &str) -> Result<AnalysisResult, AnalyzeError> {
        let request = GenerateContentRequest::new(build_prompt(text, source, self.clock.now()));

        let response = self
            .resilient
            .execute("analyze_text", Some(source), || {
                self.client.generate_content(&request)
            })
            .await?;

        let result = parse_analysis(&response).map_err(AnalyzeError::Response)?;
        tracing::info!(
            source,
            tasks = result.tasks.len(),
            priority = %result.priority,
            "Message analyzed"
        );
        Ok(result)
    }

    /// Analyze `text`, degrading to [`AnalysisResult::fallback`] on any failure.
    pub async fn analyze_or_fallback(&self, text: &str, source: &str) -> AnalysisResult {
        match self.analyze_text(text, source).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    source,
                    error = %e,
                    saturated = e.is_saturated(),
                    "LLM analysis unavailable, using fallback"
                );
                AnalysisResult::fallback(text, &e)
            }
        }
    }
}
