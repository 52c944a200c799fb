//! Task records and the persistence contract behind them.
//!
//! A task is created at most once per source message: `source_message_id`
//! is the idempotency key, and `ticket_id` is the human-facing sequential
//! identifier drawn from a single atomic counter.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::UserId;

/// Task priority. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" | "urgent" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Zero-padded sequential identifier, e.g. `000043`
    pub ticket_id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub owner: UserId,
    /// Idempotency key: the id of the message the task was detected in
    pub source_message_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build an open task stamped with the current time.
    pub fn new(
        ticket_id: impl Into<String>,
        owner: UserId,
        source_message_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            ticket_id: ticket_id.into(),
            title: title.into(),
            description: description.into(),
            due_date: None,
            priority: Priority::default(),
            status: TaskStatus::default(),
            owner,
            source_message_id: source_message_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Ordering used by task listings: priority first, then earliest due date.
    ///
    /// Tasks without a due date sort after dated ones; ticket id breaks ties.
    pub fn listing_order(a: &Task, b: &Task) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (a.due_date, b.due_date) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.ticket_id.cmp(&b.ticket_id))
    }
}

/// Result of an idempotent task upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// The task stored for the source message (the existing one on replay)
    pub task: Task,
    /// `false` when a task for this source message already existed
    pub inserted: bool,
}

/// The persistence store contract consumed by the pipeline.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// The store name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Insert `task` unless a task with the same `source_message_id` exists.
    async fn upsert_task(&self, task: Task) -> Result<UpsertOutcome, StoreError>;

    /// Atomically increment the ticket counter and return the new value.
    async fn get_next_sequence(&self) -> Result<u64, StoreError>;

    /// Last issued sequence number (0 when none was issued).
    async fn current_sequence(&self) -> Result<u64, StoreError>;

    async fn find_by_source(&self, source_message_id: &str) -> Result<Option<Task>, StoreError>;

    async fn get_by_ticket(&self, ticket_id: &str) -> Result<Option<Task>, StoreError>;

    /// Tasks of `owner`, optionally filtered by status, in [`Task::listing_order`].
    async fn list_tasks(
        &self,
        owner: &UserId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Change a task's status and refresh `updated_at`.
    async fn update_status(&self, ticket_id: &str, status: TaskStatus) -> Result<Task, StoreError>;

    /// Erase every task owned by `owner`. Returns how many were removed.
    async fn delete_owner(&self, owner: &UserId) -> Result<usize, StoreError>;

    /// The next open task: highest priority, earliest due date.
    async fn next_task(&self, owner: &UserId) -> Result<Option<Task>, StoreError> {
        Ok(self
            .list_tasks(owner, Some(TaskStatus::Open))
            .await?
            .into_iter()
            .next())
    }
}
