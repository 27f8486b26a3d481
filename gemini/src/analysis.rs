//! Prompt construction and response parsing for task extraction.

use crate::error::GeminiError;
use crate::types::GenerateContentResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Longest task title kept, in characters.
pub const MAX_TITLE_CHARS: usize = 500;

/// Context reported when the model's answer is not valid JSON.
pub const PARSE_FAILURE_CONTEXT: &str = "Failed to parse AI response";

/// Task priority as the model labels it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Needs attention now
    Urgent,
    /// Important, soon
    High,
    /// Everything else
    #[default]
    Normal,
    /// Can wait
    Low,
}

impl Priority {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Parse a label, falling back to [`Priority::Normal`] for anything unknown.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_default()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized priority label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority: {0}")]
pub struct UnknownPriority(pub String);

impl FromStr for Priority {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(UnknownPriority(s.to_string())),
        }
    }
}

/// One task extracted from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskData {
    /// Short actionable title
    pub title: String,
    /// Deadline, if one was stated
    pub due: Option<DateTime<Utc>>,
    /// Priority
    pub priority: Priority,
}

/// Result of analyzing one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Extracted tasks
    pub tasks: Vec<TaskData>,
    /// One-line summary of the message
    pub context: String,
    /// Overall priority of the message
    pub priority: Priority,
}

impl AnalysisResult {
    /// The answer used when the model's output could not be decoded.
    #[must_use]
    pub fn unparseable() -> Self {
        Self {
            tasks: Vec::new(),
            context: PARSE_FAILURE_CONTEXT.to_string(),
            priority: Priority::Normal,
        }
    }

    /// Degraded result when analysis is unavailable: the whole message
    /// becomes a single normal-priority task.
    #[must_use]
    pub fn fallback(text: &str, reason: impl fmt::Display) -> Self {
        let tasks = clean_title(text)
            .map(|title| TaskData {
                title,
                due: None,
                priority: Priority::Normal,
            })
            .into_iter()
            .collect();
        Self {
            tasks,
            context: format!("AI analysis unavailable: {reason}"),
            priority: Priority::Normal,
        }
    }
}

/// Build the task-extraction prompt for `text` received from `source`.
#[must_use]
pub fn build_prompt(text: &str, source: &str, now: DateTime<Utc>) -> String {
    format!(
        r#"Analyze this message and extract actionable tasks.

Current time: {now}
Source: {source}
Message: {text}

Priority rules:
- URGENT: explicit urgency, deadlines within 24 hours, blocking issues
- HIGH: deadlines within a week, requests from managers or clients
- NORMAL: regular requests without pressing deadlines
- LOW: nice-to-have items, FYI messages, no deadline

Respond with JSON only, in exactly this format:
{{
  "tasks": [
    {{"title": "short actionable title", "due": "ISO 8601 datetime or null", "priority": "urgent|high|normal|low"}}
  ],
  "context": "one-line summary of the message",
  "priority": "urgent|high|normal|low"
}}

If the message contains no tasks, return an empty tasks list."#,
        now = now.to_rfc3339(),
    )
}

/// Decode the model's answer.
///
/// A malformed answer is not an error: it yields [`AnalysisResult::unparseable`].
/// Individual malformed tasks are skipped.
///
/// # Errors
///
/// Returns [`GeminiError::EmptyResponse`] when the response carries no
/// candidate text at all.
pub fn parse_analysis(response: &GenerateContentResponse) -> Result<AnalysisResult, GeminiError> {
    let candidate = response
        .candidates
        .first()
        .ok_or(GeminiError::EmptyResponse("no candidates"))?;
    let part = candidate
        .content
        .as_ref()
        .and_then(|content| content.parts.first())
        .ok_or(GeminiError::EmptyResponse("no content parts"))?;
    let text = part
        .text
        .as_deref()
        .ok_or(GeminiError::EmptyResponse("no text in first part"))?;

    Ok(parse_answer(text))
}

/// Decode a JSON answer, optionally wrapped in a markdown code fence.
#[must_use]
pub fn parse_answer(text: &str) -> AnalysisResult {
    let value: Value = match serde_json::from_str(strip_code_fence(text)) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Model answer is not valid JSON");
            return AnalysisResult::unparseable();
        }
    };

    let tasks = value
        .get("tasks")
        .and_then(Value::as_array)
        .map(|tasks| {
            tasks
                .iter()
                .filter_map(|task| match parse_task(task) {
                    Ok(task) => Some(task),
                    Err(reason) => {
                        tracing::warn!(reason, "Skipping malformed task");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    AnalysisResult {
        tasks,
        context: value
            .get("context")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        priority: priority_field(&value),
    }
}

fn parse_task(task: &Value) -> Result<TaskData, &'static str> {
    let title = task
        .get("title")
        .and_then(Value::as_str)
        .and_then(clean_title)
        .ok_or("missing title")?;

    let due = match task.get("due") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(
            DateTime::parse_from_rfc3339(s.trim())
                .map_err(|_| "invalid due date")?
                .with_timezone(&Utc),
        ),
        Some(_) => return Err("invalid due date"),
    };

    Ok(TaskData {
        title,
        due,
        priority: priority_field(task),
    })
}

fn priority_field(value: &Value) -> Priority {
    value
        .get("priority")
        .and_then(Value::as_str)
        .map(Priority::from_label)
        .unwrap_or_default()
}

/// Trim and truncate a title; `None` if nothing is left.
fn clean_title(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_TITLE_CHARS).collect())
}

fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde_json::json;

    fn response(text: &str) -> GenerateContentResponse {
        serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": text}]}}]
        }))
        .unwrap()
    }

    #[test]
    fn test_parses_fenced_answer() {
        let answer = r#"```json
{"tasks": [
  {"title": "  Send report ", "due": "2025-01-02T17:00:00Z", "priority": "HIGH"},
  {"title": "Book room", "due": null, "priority": "whenever"}
], "context": "Weekly sync", "priority": "urgent"}
```"#;

        let result = parse_analysis(&response(answer)).unwrap();

        assert_eq!(result.context, "Weekly sync");
        assert_eq!(result.priority, Priority::Urgent);
        assert_eq!(result.tasks.len(), 2);
        assert_eq!(result.tasks[0].title, "Send report");
        assert_eq!(result.tasks[0].priority, Priority::High);
        assert_eq!(
            result.tasks[0].due.unwrap().to_rfc3339(),
            "2025-01-02T17:00:00+00:00"
        );
        assert_eq!(result.tasks[1].due, None);
        assert_eq!(result.tasks[1].priority, Priority::Normal);
    }

    #[test]
    fn test_skips_only_malformed_tasks() {
        let answer = json!({
            "tasks": [
                {"title": "ok"},
                {"title": "bad date", "due": "next tuesday"},
                {"title": "   "},
                {"due": "2025-01-02T17:00:00Z"},
                {"title": "numeric due", "due": 5},
                "not an object"
            ]
        })
        .to_string();

        let result = parse_answer(&answer);

        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].title, "ok");
        assert_eq!(result.context, "");
        assert_eq!(result.priority, Priority::Normal);
    }

    #[test]
    fn test_invalid_json_is_not_an_error() {
        let result = parse_analysis(&response("I could not find any tasks.")).unwrap();
        assert_eq!(result, AnalysisResult::unparseable());
        assert_eq!(result.context, PARSE_FAILURE_CONTEXT);
    }

    #[test]
    fn test_missing_text_is_an_error() {
        let empty: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(
            parse_analysis(&empty),
            Err(GeminiError::EmptyResponse("no candidates"))
        );

        let no_parts: GenerateContentResponse =
            serde_json::from_value(json!({"candidates": [{"content": {"parts": []}}]})).unwrap();
        assert_eq!(
            parse_analysis(&no_parts),
            Err(GeminiError::EmptyResponse("no content parts"))
        );

        let no_text: GenerateContentResponse =
            serde_json::from_value(json!({"candidates": [{"content": {"parts": [{}]}}]})).unwrap();
        assert_eq!(
            parse_analysis(&no_text),
            Err(GeminiError::EmptyResponse("no text in first part"))
        );
    }

    #[test]
    fn test_long_titles_truncated() {
        let long = "é".repeat(MAX_TITLE_CHARS + 20);
        let answer = json!({"tasks": [{"title": long}]}).to_string();

        let result = parse_answer(&answer);

        assert_eq!(result.tasks[0].title.chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_fallback() {
        let result = AnalysisResult::fallback("  call the bank  ", "circuit open");
        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].title, "call the bank");
        assert_eq!(result.tasks[0].priority, Priority::Normal);
        assert_eq!(result.context, "AI analysis unavailable: circuit open");

        assert!(AnalysisResult::fallback("   ", "down").tasks.is_empty());
    }

    #[test]
    fn test_prompt_mentions_inputs() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let prompt = build_prompt("Ship it by Friday", "telegram", now);

        assert!(prompt.contains("Current time: 2025-01-01T09:30:00+00:00"));
        assert!(prompt.contains("Source: telegram"));
        assert!(prompt.contains("Message: Ship it by Friday"));
        assert!(prompt.contains("\"tasks\": ["));
        assert!(prompt.contains("URGENT:"));
    }

    #[test]
    fn test_priority_labels() {
        assert_eq!(Priority::from_label(" Low "), Priority::Low);
        assert_eq!(Priority::from_label(""), Priority::Normal);
        assert!("critical".parse::<Priority>().is_err());
        assert_eq!(Priority::Urgent.to_string(), "urgent");
    }
}
