//! Task detection: raw message → preprocess → analyze → ticket → store.
//!
//! Every message resolves to a [`TaskOutcome`]; nothing here aborts a batch.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use taskmind_config::AppConfig;
use taskmind_core::error::{ErrorKind, StoreError};
use taskmind_core::message::UserId;
use taskmind_core::provider::LanguageModel;
use taskmind_core::task::{Task, TaskStore};
use tracing::{debug, info, warn};

use crate::analyze::{Analysis, TaskAnalyzer};
use crate::preprocess::preprocess;
use crate::retry::RetryPolicy;
use crate::sequencer::TicketSequencer;

/// A message delivered for task detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Provider message id; the idempotency key
    pub source_message_id: String,
    pub owner: UserId,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The model found nothing to track, or nothing was left after cleanup.
    NoTask,
    /// Older than the configured maximum message age.
    Stale,
    ParseError,
    ValidationError,
    /// Model or store unreachable after retries.
    ServiceUnavailable,
    /// Ticket counter still contended after retries.
    Conflict,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTask => "no_task",
            Self::Stale => "stale",
            Self::ParseError => "parse_error",
            Self::ValidationError => "validation_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Conflict => "conflict",
        }
    }

    fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ParseError => Self::ParseError,
            ErrorKind::ValidationError => Self::ValidationError,
            ErrorKind::Conflict => Self::Conflict,
            _ => Self::ServiceUnavailable,
        }
    }
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Created {
        task: Task,
        /// `true` when the task already existed for this message
        deduplicated: bool,
    },
    Discarded {
        reason: DiscardReason,
        detail: String,
    },
}

impl TaskOutcome {
    pub fn task(&self) -> Option<&Task> {
        match self {
            Self::Created { task, .. } => Some(task),
            Self::Discarded { .. } => None,
        }
    }

    fn discarded(reason: DiscardReason, detail: impl Into<String>) -> Self {
        Self::Discarded {
            reason,
            detail: detail.into(),
        }
    }
}

pub struct TaskPipeline {
    analyzer: TaskAnalyzer,
    sequencer: Arc<TicketSequencer>,
    store: Arc<dyn TaskStore>,
    max_concurrency: usize,
    /// `None` disables the stale filter
    max_message_age: Option<Duration>,
}

impl TaskPipeline {
    pub fn new(model: Arc<dyn LanguageModel>, store: Arc<dyn TaskStore>, config: &AppConfig) -> Self {
        Self {
            analyzer: TaskAnalyzer::new(
                model,
                config.pipeline.model_timeout(),
                RetryPolicy::from_config(&config.pipeline.retry),
            ),
            sequencer: Arc::new(TicketSequencer::new(store.clone(), &config.sequencer)),
            store,
            max_concurrency: config.pipeline.max_concurrency.max(1),
            max_message_age: config
                .pipeline
                .max_message_age()
                .map(|age| Duration::from_std(age).unwrap_or(Duration::MAX)),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Process one message.
    pub async fn process(&self, message: IncomingMessage) -> TaskOutcome {
        self.process_at(message, Utc::now()).await
    }

    /// [`process`](Self::process) with an explicit clock reading for the
    /// staleness check.
    pub async fn process_at(&self, message: IncomingMessage, now: DateTime<Utc>) -> TaskOutcome {
        let outcome = self.run(&message, now).await;
        match &outcome {
            TaskOutcome::Created { task, deduplicated } => info!(
                message = %message.source_message_id,
                ticket = %task.ticket_id,
                deduplicated,
                "Task recorded"
            ),
            TaskOutcome::Discarded { reason, detail } => info!(
                message = %message.source_message_id,
                reason = %reason,
                detail = %detail,
                "Message discarded"
            ),
        }
        outcome
    }

    /// Process messages with bounded concurrency. Results keep input order.
    pub async fn process_batch(&self, messages: Vec<IncomingMessage>) -> Vec<TaskOutcome> {
        let now = Utc::now();
        stream::iter(messages)
            .map(|message| self.process_at(message, now))
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    async fn run(&self, message: &IncomingMessage, now: DateTime<Utc>) -> TaskOutcome {
        match self.store.find_by_source(&message.source_message_id).await {
            Ok(Some(task)) => {
                return TaskOutcome::Created {
                    task,
                    deduplicated: true,
                };
            }
            Ok(None) => {}
            Err(e) => return TaskOutcome::discarded(DiscardReason::from_kind(e.kind()), e.to_string()),
        }

        if self.max_message_age.is_some_and(|max| now - message.received_at > max) {
            return TaskOutcome::discarded(
                DiscardReason::Stale,
                format!("received {}", message.received_at.to_rfc3339()),
            );
        }

        let clean = preprocess(&message.raw_text);
        if clean.is_empty() {
            return TaskOutcome::discarded(DiscardReason::NoTask, "empty after preprocessing");
        }
        debug!(message = %message.source_message_id, chars = clean.len(), "Preprocessed");

        let analysis = match self.analyzer.analyze(&clean, message.received_at).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(message = %message.source_message_id, error = %e, "Analysis failed");
                return TaskOutcome::discarded(DiscardReason::from_kind(e.kind()), e.to_string());
            }
        };
        if !analysis.has_task {
            return TaskOutcome::discarded(DiscardReason::NoTask, "no actionable task");
        }

        // Ticket and insert run on their own task so that dropping this
        // future cannot leave a ticket drawn without its task.
        let handle = tokio::spawn(persist(
            self.sequencer.clone(),
            self.store.clone(),
            message.clone(),
            analysis,
        ));
        match handle.await {
            Ok(Ok(outcome)) => TaskOutcome::Created {
                task: outcome.task,
                deduplicated: !outcome.inserted,
            },
            Ok(Err(e)) => TaskOutcome::discarded(DiscardReason::from_kind(e.kind()), e.to_string()),
            Err(e) => TaskOutcome::discarded(
                DiscardReason::ServiceUnavailable,
                format!("persistence aborted: {e}"),
            ),
        }
    }
}

async fn persist(
    sequencer: Arc<TicketSequencer>,
    store: Arc<dyn TaskStore>,
    message: IncomingMessage,
    analysis: Analysis,
) -> Result<taskmind_core::task::UpsertOutcome, StoreError> {
    let ticket = sequencer.next_ticket_id().await?;
    let mut task = Task::new(
        ticket,
        message.owner,
        message.source_message_id,
        analysis.title,
        analysis.description,
    );
    task.priority = analysis.priority;
    task.due_date = analysis.due_date;
    store.upsert_task(task).await
}
