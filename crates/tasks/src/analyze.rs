//! Structured task extraction with the language model.
//!
//! The model answers against a fixed JSON schema. A malformed answer gets
//! exactly one repair attempt with a stricter instruction; whatever the
//! second answer is decides the outcome. Transient provider failures are
//! retried per call, so a retry never replays the repair round.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::Deserialize;
use serde_json::{Value, json};
use taskmind_core::error::{ErrorKind, ProviderError};
use taskmind_core::message::Role;
use taskmind_core::provider::{LanguageModel, ModelRequest, ModelResponse, PromptMessage, ResponseSchema};
use taskmind_core::task::Priority;
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{RetryError, RetryPolicy};

const TITLE_MAX_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You read a single email and decide whether it asks the recipient to \
do something that should be tracked: an actionable request with real consequences such as bills, \
taxes, deadlines, recruitment or requests from colleagues. Advertisements, newsletters and \
notifications that need no action are not tasks. Answer with JSON only.";

const REPAIR_PROMPT: &str = "Your previous answer could not be used. Reply with exactly one JSON \
object and nothing else: no prose, no code fences. Use the keys has_task (boolean), title \
(string or null), description (string or null), priority (\"low\", \"medium\", \"high\" or null) \
and due_date (an ISO date such as 2026-03-06, a weekday name, \"today\", \"tomorrow\" or null).";

#[derive(Debug, Clone, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Transient provider failures outlasted the retry budget.
    #[error("Model unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: ProviderError },

    /// The answer was not JSON of the expected shape.
    #[error("Unparseable model output: {0}")]
    Parse(String),

    /// The answer decoded but a field is unusable.
    #[error("Invalid task fields: {0}")]
    Validation(String),
}

impl AnalyzeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(e) => e.kind(),
            Self::Unavailable { .. } => ErrorKind::ServiceUnavailable,
            Self::Parse(_) => ErrorKind::ParseError,
            Self::Validation(_) => ErrorKind::ValidationError,
        }
    }
}

/// A validated analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub has_task: bool,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
}

impl Analysis {
    fn no_task() -> Self {
        Self {
            has_task: false,
            title: String::new(),
            description: String::new(),
            priority: Priority::default(),
            due_date: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    has_task: bool,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<Value>,
    #[serde(default)]
    due_date: Option<String>,
}

pub struct TaskAnalyzer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl TaskAnalyzer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self { model, timeout, retry }
    }

    pub fn response_schema() -> ResponseSchema {
        ResponseSchema {
            name: "task_detection".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "has_task": { "type": "boolean" },
                    "title": { "type": ["string", "null"] },
                    "description": { "type": ["string", "null"] },
                    "priority": { "type": ["string", "null"], "enum": ["low", "medium", "high", null] },
                    "due_date": { "type": ["string", "null"] }
                },
                "required": ["has_task", "title", "description", "priority", "due_date"],
                "additionalProperties": false
            }),
        }
    }

    /// Analyze a cleaned message received at `received_at`.
    pub async fn analyze(
        &self,
        clean_text: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Analysis, AnalyzeError> {
        let mut messages = vec![PromptMessage::user(format!(
            "Received: {}\n\nEmail:\n{}",
            received_at.format("%Y-%m-%d (%A)"),
            clean_text
        ))];

        let response = self.invoke(messages.clone()).await?;
        let problem = match interpret(&response, received_at) {
            Ok(analysis) => return Ok(analysis),
            Err(problem) => problem,
        };

        warn!(error = %problem, "Malformed analysis, requesting repair");
        messages.push(PromptMessage::new(Role::Assistant, response.text));
        messages.push(PromptMessage::user(format!("{REPAIR_PROMPT}\nProblem: {problem}")));
        let repaired = self.invoke(messages).await?;
        interpret(&repaired, received_at)
    }

    async fn invoke(&self, messages: Vec<PromptMessage>) -> Result<ModelResponse, AnalyzeError> {
        let request = ModelRequest::new(SYSTEM_PROMPT, messages, self.timeout)
            .with_schema(Self::response_schema());
        let response = self
            .retry
            .run_with_hint(
                || self.model.invoke(request.clone()),
                ProviderError::is_transient,
                ProviderError::retry_after,
            )
            .await
            .map_err(|e| match e {
                RetryError::Fatal(e) => AnalyzeError::Provider(e),
                RetryError::Exhausted { attempts, last } => {
                    warn!(attempts, error = %last, "Model unavailable");
                    AnalyzeError::Unavailable { attempts, last }
                }
            })?;
        debug!(model = %response.model, chars = response.text.len(), "Analysis received");
        Ok(response)
    }
}

/// Decode and validate one model answer.
fn interpret(response: &ModelResponse, received_at: DateTime<Utc>) -> Result<Analysis, AnalyzeError> {
    let value = match &response.structured {
        Some(value) => value.clone(),
        None => serde_json::from_str(strip_fences(&response.text))
            .map_err(|e| AnalyzeError::Parse(e.to_string()))?,
    };
    let raw: RawAnalysis =
        serde_json::from_value(value).map_err(|e| AnalyzeError::Parse(e.to_string()))?;
    validate(raw, received_at)
}

fn validate(raw: RawAnalysis, received_at: DateTime<Utc>) -> Result<Analysis, AnalyzeError> {
    if !raw.has_task {
        return Ok(Analysis::no_task());
    }

    let title = raw.title.as_deref().map(str::trim).unwrap_or_default();
    if title.is_empty() {
        return Err(AnalyzeError::Validation("title is empty".into()));
    }
    let title: String = title.chars().take(TITLE_MAX_CHARS).collect();

    let priority = match raw.priority {
        None | Some(Value::Null) => Priority::default(),
        Some(value) => parse_priority(&value).ok_or_else(|| {
            AnalyzeError::Validation(format!("unknown priority {value}"))
        })?,
    };

    let due_date = match raw.due_date.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) if matches!(s.to_ascii_lowercase().as_str(), "null" | "none" | "n/a") => None,
        Some(s) => Some(resolve_due_date(s, received_at).ok_or_else(|| {
            AnalyzeError::Validation(format!("unrecognized due date {s:?}"))
        })?),
    };

    Ok(Analysis {
        has_task: true,
        title,
        description: raw.description.map(|d| d.trim().to_string()).unwrap_or_default(),
        priority,
        due_date,
    })
}

/// Priority as a name, or as the numeric scale 0 (high) to 3 (lowest).
fn parse_priority(value: &Value) -> Option<Priority> {
    match value {
        Value::String(s) => Priority::parse(s),
        Value::Number(n) => match n.as_u64()? {
            0 => Some(Priority::High),
            1 => Some(Priority::Medium),
            2 | 3 => Some(Priority::Low),
            _ => None,
        },
        _ => None,
    }
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Resolve a due date expression relative to when the message arrived.
///
/// Accepts ISO dates and datetimes, `today`, `tomorrow`, and weekday names
/// with an optional `next`/`this` and leading `by`/`on`/`before`/`due`.
/// Weekdays resolve to the next occurrence strictly after the received day.
pub fn resolve_due_date(raw: &str, received_at: DateTime<Utc>) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }

    let today = received_at.date_naive();
    let lower = raw.to_lowercase();
    let mut phrase = lower.trim_end_matches(['.', '!']).trim();
    for prefix in ["by ", "on ", "before ", "due "] {
        if let Some(rest) = phrase.strip_prefix(prefix) {
            phrase = rest.trim();
        }
    }
    match phrase {
        "today" => return Some(today),
        "tomorrow" => return today.succ_opt(),
        _ => {}
    }
    let phrase = phrase
        .strip_prefix("next ")
        .or_else(|| phrase.strip_prefix("this "))
        .unwrap_or(phrase);
    let weekday = phrase.parse::<Weekday>().ok()?;
    Some(next_weekday_after(today, weekday))
}

fn next_weekday_after(day: NaiveDate, target: Weekday) -> NaiveDate {
    let ahead = (target.num_days_from_monday() + 7 - day.weekday().num_days_from_monday()) % 7;
    let ahead = if ahead == 0 { 7 } else { ahead };
    day + chrono::Duration::days(i64::from(ahead))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use chrono::TimeZone;
    use taskmind_config::RetryConfig;

    // Tuesday
    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, 9, 30, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn analyzer(model: &Arc<ScriptedModel>) -> TaskAnalyzer {
        let retry = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        });
        TaskAnalyzer::new(model.clone(), Duration::from_secs(5), retry)
    }

    // ── Due dates ───────────────────────────────────────────────────────

    #[test]
    fn weekday_resolves_to_upcoming_occurrence() {
        assert_eq!(resolve_due_date("Friday", received()), Some(date(2026, 3, 6)));
        assert_eq!(resolve_due_date("by next Friday", received()), Some(date(2026, 3, 6)));
        assert_eq!(resolve_due_date("mon", received()), Some(date(2026, 3, 9)));
        // Same weekday as received means a week later
        assert_eq!(resolve_due_date("Tuesday", received()), Some(date(2026, 3, 10)));
    }

    #[test]
    fn relative_and_iso_dates() {
        assert_eq!(resolve_due_date("today", received()), Some(date(2026, 3, 3)));
        assert_eq!(resolve_due_date("Tomorrow", received()), Some(date(2026, 3, 4)));
        assert_eq!(resolve_due_date("2026-04-15", received()), Some(date(2026, 4, 15)));
        assert_eq!(
            resolve_due_date("2026-04-15T17:00:00Z", received()),
            Some(date(2026, 4, 15))
        );
        assert_eq!(resolve_due_date("2026-04-15T17:00:00", received()), Some(date(2026, 4, 15)));
        assert_eq!(resolve_due_date("someday", received()), None);
    }

    // ── Decoding ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn extracts_task_fields() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"has_task": true, "title": "Send Q3 report", "description": "Email the Q3 report",
                "priority": "medium", "due_date": "Friday"}"#,
        ));
        let analysis = analyzer(&model)
            .analyze("Please send the Q3 report by Friday", received())
            .await
            .unwrap();
        assert_eq!(
            analysis,
            Analysis {
                has_task: true,
                title: "Send Q3 report".into(),
                description: "Email the Q3 report".into(),
                priority: Priority::Medium,
                due_date: Some(date(2026, 3, 6)),
            }
        );

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].schema.is_some());
        assert!(requests[0].messages[0].content.contains("2026-03-03 (Tuesday)"));
    }

    #[tokio::test]
    async fn no_task_skips_validation() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"has_task": false, "title": null, "description": null, "priority": "bogus", "due_date": null}"#,
        ));
        let analysis = analyzer(&model).analyze("50% off shoes!", received()).await.unwrap();
        assert!(!analysis.has_task);
    }

    #[tokio::test]
    async fn fenced_json_and_numeric_priority_are_accepted() {
        let model = Arc::new(ScriptedModel::always(
            "```json\n{\"has_task\": true, \"title\": \"Pay taxes\", \"priority\": 0}\n```",
        ));
        let analysis = analyzer(&model).analyze("Taxes due", received()).await.unwrap();
        assert_eq!(analysis.priority, Priority::High);
        assert_eq!(analysis.due_date, None);
        assert_eq!(analysis.description, "");
    }

    // ── Repair ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn malformed_output_is_repaired_once() {
        let model = Arc::new(ScriptedModel::sequence(vec![
            Ok("Sure! Here is the task you asked for.".into()),
            Ok(r#"{"has_task": true, "title": "Renew passport", "due_date": "tomorrow"}"#.into()),
        ]));
        let analysis = analyzer(&model).analyze("Renew passport", received()).await.unwrap();
        assert_eq!(analysis.title, "Renew passport");
        assert_eq!(analysis.due_date, Some(date(2026, 3, 4)));

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        let repair = requests[1].messages.last().unwrap();
        assert!(repair.content.contains("exactly one JSON object"));
    }

    #[tokio::test]
    async fn persistent_garbage_is_a_parse_error() {
        let model = Arc::new(ScriptedModel::always("not json at all"));
        let err = analyzer(&model).analyze("hello", received()).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Parse(_)));
        assert_eq!(err.kind(), ErrorKind::ParseError);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_bad_fields_are_a_validation_error() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"has_task": true, "title": "Book flights", "priority": "whenever"}"#,
        ));
        let err = analyzer(&model).analyze("Book flights", received()).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Validation(_)));
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn empty_title_is_invalid() {
        let model = Arc::new(ScriptedModel::always(r#"{"has_task": true, "title": "  "}"#));
        let err = analyzer(&model).analyze("x", received()).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Validation(_)));
    }

    #[tokio::test]
    async fn provider_errors_are_not_repaired() {
        let model = Arc::new(ScriptedModel::sequence(vec![Err(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let err = analyzer(&model).analyze("x", received()).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Provider(ProviderError::AuthenticationFailed(_))));
        assert_eq!(model.calls(), 1);
    }

    // ── Transient failures ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn timeout_during_repair_resends_only_the_repair() {
        let model = Arc::new(ScriptedModel::sequence(vec![
            Ok("Sure! Here is the task you asked for.".into()),
            Err(ProviderError::Timeout("5s".into())),
            Ok(r#"{"has_task": true, "title": "Renew passport"}"#.into()),
        ]));
        let analysis = analyzer(&model).analyze("Renew passport", received()).await.unwrap();
        assert_eq!(analysis.title, "Renew passport");

        let requests = model.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[2].messages, requests[1].messages);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_after_retried_repair_is_final() {
        let model = Arc::new(
            ScriptedModel::sequence(vec![
                Ok("not json".into()),
                Err(ProviderError::Timeout("5s".into())),
            ])
            .then_always("still not json"),
        );
        let err = analyzer(&model).analyze("hello", received()).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Parse(_)));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_attempts() {
        let failures = (0..5).map(|_| Err(ProviderError::Network("reset".into()))).collect();
        let model = Arc::new(ScriptedModel::sequence(failures));
        let err = analyzer(&model).analyze("hello", received()).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Unavailable { attempts: 3, .. }), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(model.calls(), 3);
    }
}
