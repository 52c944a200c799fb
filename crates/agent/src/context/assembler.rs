//! Context assembly: session turns plus long-term matches under one budget.
//!
//! # Ranking
//!
//! Candidates are ranked in a single priority list:
//!
//! 1. Session turns, newest first
//! 2. The session's rolling summary, if one was written
//! 3. Long-term matches, by score (desc), recency (desc), id (asc)
//!
//! Items are included greedily in that order. Assembly stops at the first
//! item that does not fit; items are never split. The output lists the
//! summary, then included memory items in rank order, then included session
//! turns in chronological order.
//!
//! # Determinism
//!
//! No clock or random input affects ranking, so identical stores and
//! requests always yield identical windows.
//!
//! # Degradation
//!
//! Failures never reach the caller. An unreachable or slow index yields a
//! session-only window; a budget too small for the newest turn yields a
//! window holding just that turn. Both are reported on
//! [`ContextWindow::degradation`].

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use taskmind_config::AppConfig;
use taskmind_core::error::{ErrorKind, MemoryError};
use taskmind_core::memory::{MemoryIndex, ScoredRecord};
use taskmind_core::message::{Role, SessionId, Turn, UserId};
use taskmind_core::provider::{Embedder, PromptMessage};
use taskmind_memory::{SessionStore, SessionSummary};
use tracing::{debug, warn};

use crate::context::token;

// ── Types ─────────────────────────────────────────────────────────────────

/// Input to [`ContextAssembler::assemble`].
#[derive(Debug, Clone)]
pub struct AssembleRequest {
    pub session_id: SessionId,
    pub user_id: UserId,
    /// Text used to search long-term memory (usually the current message).
    pub query_text: String,
    pub token_budget: usize,
}

/// Where a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Session,
    Summary,
    Memory,
}

/// One entry of an assembled context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub role: Role,
    pub text: String,
    pub origin: Origin,
    /// Similarity score, set for memory items only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Estimated size including per-item overhead.
    pub tokens: usize,
    pub timestamp: DateTime<Utc>,
    /// Turn id or memory record id.
    pub source_id: String,
}

impl ContextItem {
    fn from_turn(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            text: turn.content.clone(),
            origin: Origin::Session,
            score: None,
            tokens: token::estimate_item_tokens(&turn.content),
            timestamp: turn.timestamp,
            source_id: turn.id.clone(),
        }
    }

    fn from_summary(session_id: &SessionId, summary: &SessionSummary) -> Self {
        Self {
            role: Role::System,
            text: summary.text.clone(),
            origin: Origin::Summary,
            score: None,
            tokens: token::estimate_item_tokens(&summary.text),
            timestamp: summary.updated_at,
            source_id: format!("summary:{session_id}"),
        }
    }

    fn from_match(hit: &ScoredRecord) -> Self {
        Self {
            role: hit.record.role,
            text: hit.record.text.clone(),
            origin: Origin::Memory,
            score: Some(hit.score),
            tokens: token::estimate_item_tokens(&hit.record.text),
            timestamp: hit.record.created_at,
            source_id: hit.record.id.clone(),
        }
    }
}

/// Why a window is less complete than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// Long-term memory could not be consulted; the window is session-only.
    IndexUnavailable,
    /// The budget cannot hold the newest turn; the window holds only that turn.
    CapacityExceeded,
}

impl Degradation {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IndexUnavailable => ErrorKind::ServiceUnavailable,
            Self::CapacityExceeded => ErrorKind::CapacityExceeded,
        }
    }
}

/// The assembled, budget-bounded context. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextWindow {
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
    pub budget: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
}

impl ContextWindow {
    pub fn memory_items(&self) -> impl Iterator<Item = &ContextItem> {
        self.items.iter().filter(|i| i.origin == Origin::Memory)
    }

    pub fn session_items(&self) -> impl Iterator<Item = &ContextItem> {
        self.items.iter().filter(|i| i.origin == Origin::Session)
    }

    pub fn summary_item(&self) -> Option<&ContextItem> {
        self.items.iter().find(|i| i.origin == Origin::Summary)
    }

    /// Text of the most recent user turn in the window.
    pub fn last_user_text(&self) -> Option<&str> {
        self.session_items()
            .filter(|i| i.role == Role::User)
            .last()
            .map(|i| i.text.as_str())
    }

    /// Turn the window into a system prompt and a message list.
    ///
    /// The summary and memory items become sections appended to
    /// `system_prompt`, summary first; session items become the conversation.
    pub fn render(&self, system_prompt: &str) -> (String, Vec<PromptMessage>) {
        let mut system = system_prompt.to_string();
        if let Some(summary) = self.summary_item() {
            system.push_str("\n\nSummary of this conversation so far:\n");
            system.push_str(&summary.text);
        }
        let mut notes = self.memory_items().peekable();
        if notes.peek().is_some() {
            system.push_str("\n\nRelevant notes from earlier conversations:");
            for item in notes {
                system.push_str(&format!("\n- [{}] {}", item.role, item.text));
            }
        }

        let messages = self
            .session_items()
            .map(|item| {
                let role = match item.role {
                    Role::User | Role::Assistant => item.role,
                    Role::System | Role::Tool => Role::System,
                };
                PromptMessage::new(role, item.text.clone())
            })
            .collect();

        (system, messages)
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Builds [`ContextWindow`]s from the session store and the memory index.
pub struct ContextAssembler {
    sessions: Arc<SessionStore>,
    index: Arc<dyn MemoryIndex>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    index_timeout: Duration,
}

impl ContextAssembler {
    pub fn new(
        sessions: Arc<SessionStore>,
        index: Arc<dyn MemoryIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            sessions,
            index,
            embedder,
            top_k: 5,
            index_timeout: Duration::from_millis(1500),
        }
    }

    pub fn from_config(
        sessions: Arc<SessionStore>,
        index: Arc<dyn MemoryIndex>,
        embedder: Arc<dyn Embedder>,
        config: &AppConfig,
    ) -> Self {
        Self::new(sessions, index, embedder)
            .with_top_k(config.memory.top_k)
            .with_index_timeout(config.context.index_timeout())
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = timeout;
        self
    }

    /// Assemble the context for one model call. Never fails.
    pub async fn assemble(&self, request: &AssembleRequest) -> ContextWindow {
        let turns = match self.sessions.get_owned(&request.session_id, &request.user_id).await {
            Ok(turns) => turns,
            Err(e) => {
                debug!(session = %request.session_id, error = %e, "No live session, continuing without history");
                Vec::new()
            }
        };
        let summary = if turns.is_empty() {
            None
        } else {
            self.sessions
                .summary(&request.session_id, &request.user_id)
                .await
                .ok()
                .flatten()
        };

        let mut degradation = None;
        let matches = if self.top_k == 0 || request.query_text.trim().is_empty() {
            Vec::new()
        } else {
            match self.long_term(request, &turns).await {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(user = %request.user_id, error = %e, "Memory index unavailable, using session-only context");
                    degradation = Some(Degradation::IndexUnavailable);
                    Vec::new()
                }
            }
        };

        let budget = request.token_budget;
        let mut total = 0usize;
        let mut session_newest_first = Vec::new();
        let mut summary_item = None;
        let mut memory = Vec::new();

        let candidates = turns
            .iter()
            .rev()
            .map(ContextItem::from_turn)
            .chain(summary.iter().map(|s| ContextItem::from_summary(&request.session_id, s)))
            .chain(matches.iter().map(ContextItem::from_match));
        for item in candidates {
            if total + item.tokens > budget {
                break;
            }
            total += item.tokens;
            match item.origin {
                Origin::Session => session_newest_first.push(item),
                Origin::Summary => summary_item = Some(item),
                Origin::Memory => memory.push(item),
            }
        }

        let nothing_fit =
            session_newest_first.is_empty() && summary_item.is_none() && memory.is_empty();
        if nothing_fit && (!turns.is_empty() || !matches.is_empty()) {
            degradation = Some(Degradation::CapacityExceeded);
            if let Some(newest) = turns.last() {
                let item = ContextItem::from_turn(newest);
                warn!(
                    session = %request.session_id,
                    budget,
                    tokens = item.tokens,
                    "Token budget cannot hold the newest turn"
                );
                total = item.tokens;
                session_newest_first.push(item);
            }
        }

        session_newest_first.reverse();
        let mut items: Vec<ContextItem> = summary_item.into_iter().collect();
        items.extend(memory);
        items.extend(session_newest_first);

        debug!(
            session = %request.session_id,
            items = items.len(),
            total_tokens = total,
            budget,
            "Context assembled"
        );

        ContextWindow {
            items,
            total_tokens: total,
            budget,
            degradation,
        }
    }

    /// Top-k long-term matches, minus verbatim copies of session turns.
    async fn long_term(
        &self,
        request: &AssembleRequest,
        turns: &[Turn],
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        let seen_text: HashSet<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        let seen_turns: HashSet<&str> = turns.iter().map(|t| t.id.as_str()).collect();

        let lookup = async {
            let embedding = self
                .embedder
                .embed(&request.query_text)
                .await
                .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;
            self.index
                .query(&embedding, self.top_k + turns.len(), &request.user_id)
                .await
        };

        let mut matches = tokio::time::timeout(self.index_timeout, lookup)
            .await
            .map_err(|_| {
                MemoryError::Unavailable(format!("query timed out after {:?}", self.index_timeout))
            })??;

        matches.retain(|m| {
            !seen_text.contains(m.record.text.as_str())
                && !m
                    .record
                    .source_turn
                    .as_deref()
                    .is_some_and(|t| seen_turns.contains(t))
        });
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        matches.truncate(self.top_k);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use taskmind_config::SessionConfig;
    use taskmind_core::memory::MemoryRecord;
    use taskmind_providers::HashingEmbedder;

    // ── Test doubles ──────────────────────────────────────────────────────

    /// Returns a fixed result list regardless of the query embedding.
    struct StaticIndex {
        hits: Vec<ScoredRecord>,
    }

    #[async_trait]
    impl MemoryIndex for StaticIndex {
        fn name(&self) -> &str {
            "static"
        }
        async fn upsert(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
            Ok(record)
        }
        async fn query(
            &self,
            _embedding: &[f32],
            k: usize,
            user_id: &UserId,
        ) -> Result<Vec<ScoredRecord>, MemoryError> {
            Ok(self
                .hits
                .iter()
                .filter(|h| h.record.user_id == *user_id)
                .take(k)
                .cloned()
                .collect())
        }
        async fn remove_user(&self, _user_id: &UserId) -> Result<usize, MemoryError> {
            Ok(0)
        }
        async fn get(&self, _id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
            Ok(None)
        }
        async fn count(&self) -> Result<usize, MemoryError> {
            Ok(self.hits.len())
        }
    }

    /// Always unreachable, or hangs when `hang` is set.
    struct BrokenIndex {
        hang: bool,
    }

    #[async_trait]
    impl MemoryIndex for BrokenIndex {
        fn name(&self) -> &str {
            "broken"
        }
        async fn upsert(&self, _record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
            Err(MemoryError::Unavailable("down".into()))
        }
        async fn query(
            &self,
            _embedding: &[f32],
            _k: usize,
            _user_id: &UserId,
        ) -> Result<Vec<ScoredRecord>, MemoryError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(MemoryError::Unavailable("down".into()))
        }
        async fn remove_user(&self, _user_id: &UserId) -> Result<usize, MemoryError> {
            Err(MemoryError::Unavailable("down".into()))
        }
        async fn get(&self, _id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
            Err(MemoryError::Unavailable("down".into()))
        }
        async fn count(&self) -> Result<usize, MemoryError> {
            Err(MemoryError::Unavailable("down".into()))
        }
    }

    fn hit(id: &str, text: &str, score: f32, minute: u32) -> ScoredRecord {
        let mut record = MemoryRecord::new(UserId::from("alice"), SessionId::from("old"), Role::User, text);
        record.id = id.into();
        record.created_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap();
        ScoredRecord { record, score }
    }

    fn sessions() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(&SessionConfig::default()))
    }

    async fn seed(store: &SessionStore, texts: &[&str]) {
        let base = Utc::now() - chrono::Duration::minutes(10);
        for (i, text) in texts.iter().enumerate() {
            let turn = if i % 2 == 0 { Turn::user(*text) } else { Turn::assistant(*text) };
            let turn = turn.at(base + chrono::Duration::seconds(i as i64));
            store
                .append(&SessionId::from("s1"), &UserId::from("alice"), turn)
                .await
                .unwrap();
        }
    }

    fn assembler(store: Arc<SessionStore>, index: Arc<dyn MemoryIndex>) -> ContextAssembler {
        ContextAssembler::new(store, index, Arc::new(HashingEmbedder::new(32)))
    }

    fn request(budget: usize) -> AssembleRequest {
        AssembleRequest {
            session_id: SessionId::from("s1"),
            user_id: UserId::from("alice"),
            query_text: "what did we decide".into(),
            token_budget: budget,
        }
    }

    fn texts(window: &ContextWindow) -> Vec<&str> {
        window.items.iter().map(|i| i.text.as_str()).collect()
    }

    // ── Ordering ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn memory_first_then_session_chronological() {
        let store = sessions();
        seed(&store, &["turn one", "turn two", "turn three"]).await;
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "best match", 0.9, 0), hit("m2", "second match", 0.5, 0)],
        });

        let window = assembler(store, index).assemble(&request(1000)).await;
        assert_eq!(
            texts(&window),
            vec!["best match", "second match", "turn one", "turn two", "turn three"]
        );
        assert_eq!(window.memory_items().next().unwrap().score, Some(0.9));
        assert!(window.session_items().all(|i| i.score.is_none()));
        assert!(window.degradation.is_none());
    }

    #[tokio::test]
    async fn verbatim_duplicates_of_session_turns_are_dropped() {
        let store = sessions();
        seed(&store, &["we picked Tuesday"]).await;
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "we picked Tuesday", 0.99, 0), hit("m2", "budget is 5k", 0.4, 0)],
        });

        let window = assembler(store, index).assemble(&request(1000)).await;
        assert_eq!(texts(&window), vec!["budget is 5k", "we picked Tuesday"]);
    }

    #[tokio::test]
    async fn equal_scores_prefer_recent_then_id() {
        let store = sessions();
        let index = Arc::new(StaticIndex {
            hits: vec![
                hit("b", "older", 0.7, 1),
                hit("z", "newest", 0.7, 5),
                hit("a", "older twin", 0.7, 1),
            ],
        });
        let window = assembler(store, index).assemble(&request(1000)).await;
        assert_eq!(texts(&window), vec!["newest", "older twin", "older"]);
    }

    // ── Budget ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn session_outranks_memory_under_budget() {
        // Every text is 8 chars: 2 tokens + 4 overhead = 6 tokens per item
        let store = sessions();
        seed(&store, &["aaaaaaaa", "bbbbbbbb", "cccccccc"]).await;
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "mmmmmmm1", 0.9, 0), hit("m2", "mmmmmmm2", 0.8, 0)],
        });
        let asm = assembler(store, index);

        let window = asm.assemble(&request(20)).await;
        assert_eq!(texts(&window), vec!["aaaaaaaa", "bbbbbbbb", "cccccccc"]);
        assert_eq!(window.total_tokens, 18);

        let window = asm.assemble(&request(25)).await;
        assert_eq!(texts(&window), vec!["mmmmmmm1", "aaaaaaaa", "bbbbbbbb", "cccccccc"]);
        assert_eq!(window.total_tokens, 24);
        assert!(window.total_tokens <= window.budget);
    }

    #[tokio::test]
    async fn stops_at_first_item_that_does_not_fit() {
        let store = sessions();
        let long = "x".repeat(400);
        seed(&store, &["oldest", long.as_str(), "newest"]).await;
        let window = assembler(store, Arc::new(StaticIndex { hits: vec![] }))
            .assemble(&request(30))
            .await;
        // "oldest" would fit on its own, but inclusion stops at the long turn
        assert_eq!(texts(&window), vec!["newest"]);
    }

    #[tokio::test]
    async fn tiny_budget_keeps_only_newest_turn() {
        let store = sessions();
        seed(&store, &["first message", "the newest message here"]).await;
        let window = assembler(store, Arc::new(StaticIndex { hits: vec![] }))
            .assemble(&request(3))
            .await;
        assert_eq!(texts(&window), vec!["the newest message here"]);
        assert_eq!(window.degradation, Some(Degradation::CapacityExceeded));
        assert!(window.total_tokens > window.budget);
        assert_eq!(Degradation::CapacityExceeded.kind(), ErrorKind::CapacityExceeded);
    }

    // ── Summary ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn summary_ranks_after_turns_and_before_memory() {
        let store = sessions();
        seed(&store, &["aaaaaaaa", "bbbbbbbb"]).await;
        store
            .set_summary(&SessionId::from("s1"), &UserId::from("alice"), "ssssssss", 2)
            .await
            .unwrap();
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "mmmmmmm1", 0.9, 0)],
        });
        let asm = assembler(store, index);

        // 6 tokens per item: both turns and the summary fit, the match does not
        let window = asm.assemble(&request(20)).await;
        assert_eq!(texts(&window), vec!["ssssssss", "aaaaaaaa", "bbbbbbbb"]);
        assert_eq!(window.summary_item().unwrap().origin, Origin::Summary);
        assert_eq!(window.memory_items().count(), 0);

        let window = asm.assemble(&request(12)).await;
        assert_eq!(texts(&window), vec!["aaaaaaaa", "bbbbbbbb"]);
        assert!(window.summary_item().is_none());

        let window = asm.assemble(&request(1000)).await;
        assert_eq!(texts(&window), vec!["ssssssss", "mmmmmmm1", "aaaaaaaa", "bbbbbbbb"]);
    }

    #[tokio::test]
    async fn render_puts_summary_ahead_of_notes() {
        let store = sessions();
        seed(&store, &["book a room"]).await;
        store
            .set_summary(&SessionId::from("s1"), &UserId::from("alice"), "planning the offsite", 1)
            .await
            .unwrap();
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "prefers mornings", 0.8, 0)],
        });
        let window = assembler(store, index).assemble(&request(1000)).await;
        let (system, messages) = window.render("You are helpful.");
        let summary_at = system.find("planning the offsite").unwrap();
        let notes_at = system.find("prefers mornings").unwrap();
        assert!(summary_at < notes_at);
        assert_eq!(messages.len(), 1);
    }

    // ── Degradation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unreachable_index_gives_session_only_context() {
        let store = sessions();
        seed(&store, &["hello", "hi there"]).await;
        let window = assembler(store, Arc::new(BrokenIndex { hang: false }))
            .assemble(&request(1000))
            .await;
        assert_eq!(texts(&window), vec!["hello", "hi there"]);
        assert_eq!(window.degradation, Some(Degradation::IndexUnavailable));
        assert_eq!(Degradation::IndexUnavailable.kind(), ErrorKind::ServiceUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_index_times_out() {
        let store = sessions();
        seed(&store, &["hello"]).await;
        let window = assembler(store, Arc::new(BrokenIndex { hang: true }))
            .with_index_timeout(Duration::from_millis(100))
            .assemble(&request(1000))
            .await;
        assert_eq!(texts(&window), vec!["hello"]);
        assert_eq!(window.degradation, Some(Degradation::IndexUnavailable));
    }

    #[tokio::test]
    async fn missing_session_still_uses_memory() {
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "remembered fact", 0.8, 0)],
        });
        let window = assembler(sessions(), index).assemble(&request(1000)).await;
        assert_eq!(texts(&window), vec!["remembered fact"]);
        assert!(window.degradation.is_none());
    }

    #[tokio::test]
    async fn other_users_memories_never_appear() {
        let mut foreign = hit("m1", "bob's secret", 0.99, 0);
        foreign.record.user_id = UserId::from("bob");
        let window = assembler(sessions(), Arc::new(StaticIndex { hits: vec![foreign] }))
            .assemble(&request(1000))
            .await;
        assert!(window.items.is_empty());
    }

    // ── Determinism & rendering ───────────────────────────────────────────

    #[tokio::test]
    async fn assembly_is_deterministic() {
        let store = sessions();
        seed(&store, &["a", "b", "c", "d"]).await;
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "x", 0.5, 0), hit("m2", "y", 0.5, 0), hit("m3", "z", 0.6, 2)],
        });
        let asm = assembler(store, index);
        let first = asm.assemble(&request(30)).await;
        for _ in 0..5 {
            assert_eq!(asm.assemble(&request(30)).await, first);
        }
    }

    #[tokio::test]
    async fn render_puts_memories_in_system_prompt() {
        let store = sessions();
        seed(&store, &["book a room", "which day?"]).await;
        let index = Arc::new(StaticIndex {
            hits: vec![hit("m1", "prefers mornings", 0.8, 0)],
        });
        let window = assembler(store, index).assemble(&request(1000)).await;
        let (system, messages) = window.render("You are helpful.");
        assert!(system.starts_with("You are helpful."));
        assert!(system.contains("prefers mornings"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(window.last_user_text(), Some("book a room"));
    }
}
