//! Long-term memory: embedded fragments of past conversation.
//!
//! A [`MemoryRecord`] outlives the session it came from. Records are
//! immutable once stored; the only permitted change is a soft delete used
//! for data erasure. Retrieval is always scoped to a single user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MemoryError;
use crate::message::{Role, SessionId, Turn, UserId};

/// A persisted, embedded fragment of past conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique ID for this record
    pub id: String,

    /// Owning user; queries never cross this boundary
    pub user_id: UserId,

    /// Session the fragment was taken from
    pub session_id: SessionId,

    /// Role of the source turn
    pub role: Role,

    /// The remembered text
    pub text: String,

    /// Fixed-dimension embedding. Empty until the index embeds it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// ID of the turn this record was embedded from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_turn: Option<String>,

    /// Set when the record was erased
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn new(user_id: UserId, session_id: SessionId, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            session_id,
            role,
            text: text.into(),
            embedding: Vec::new(),
            created_at: Utc::now(),
            source_turn: None,
            deleted_at: None,
        }
    }

    /// Build a record from a session turn, keeping the turn's timestamp.
    pub fn from_turn(user_id: UserId, session_id: SessionId, turn: &Turn) -> Self {
        Self {
            created_at: turn.timestamp,
            source_turn: Some(turn.id.clone()),
            ..Self::new(user_id, session_id, turn.role, turn.content.clone())
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A record returned from a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    /// Cosine similarity to the query embedding, in [-1, 1]
    pub score: f32,
}

/// The long-term vector memory contract.
///
/// Implementations must publish each upsert atomically: a concurrent query
/// sees either the whole record or nothing.
#[async_trait]
pub trait MemoryIndex: Send + Sync {
    /// The index name (e.g., "file", "unavailable").
    fn name(&self) -> &str;

    /// Embed (when the record carries no embedding) and insert a record.
    ///
    /// Re-upserting an existing id returns the stored record unchanged.
    async fn upsert(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError>;

    /// Top-k live records of `user_id` most similar to `embedding`.
    ///
    /// Ordered by descending score; ties break by more-recent-first.
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        user_id: &UserId,
    ) -> Result<Vec<ScoredRecord>, MemoryError>;

    /// Erase every record owned by `user_id`. Returns how many were removed.
    async fn remove_user(&self, user_id: &UserId) -> Result<usize, MemoryError>;

    /// Fetch a record by ID, including soft-deleted ones.
    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError>;

    /// Number of live records.
    async fn count(&self) -> Result<usize, MemoryError>;
}
