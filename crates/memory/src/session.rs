//! Short-term conversational memory.
//!
//! Each session is a bounded ring buffer of recent turns that expires after a
//! period of inactivity. The arena map is locked only long enough to look up
//! or insert a slot; all per-session work happens under that slot's own
//! mutex, so distinct sessions never wait on each other.
//!
//! A session may also carry a rolling summary of its older turns. The store
//! only keeps it; producing it is the caller's job.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskmind_config::SessionConfig;
use taskmind_core::error::SessionError;
use taskmind_core::message::{SessionId, Turn, UserId};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

struct SessionSlot {
    owner: UserId,
    state: Mutex<SessionState>,
}

struct SessionState {
    turns: VecDeque<Turn>,
    expires_at: DateTime<Utc>,
    /// Turns appended over the session's lifetime, evicted ones included
    appended: u64,
    summary: Option<SessionSummary>,
}

/// Rolling summary of a session's turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub text: String,
    /// Value of [`SummaryProgress::appended`] the summary was written at
    pub covered: u64,
    pub updated_at: DateTime<Utc>,
}

/// How far a session's summary lags behind its turns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryProgress {
    pub appended: u64,
    pub summary: Option<SessionSummary>,
}

impl SummaryProgress {
    /// Turns appended since the summary was last written.
    pub fn pending(&self) -> u64 {
        let covered = self.summary.as_ref().map_or(0, |s| s.covered);
        self.appended.saturating_sub(covered)
    }
}

impl SessionState {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Drop turns past the count cap, then turns past the age cap.
    /// The newest turn always survives.
    fn evict(&mut self, now: DateTime<Utc>, max_turns: usize, max_age: Duration) {
        while self.turns.len() > max_turns {
            self.turns.pop_front();
        }
        let cutoff = now - max_age;
        while self.turns.len() > 1 && self.turns.front().is_some_and(|t| t.timestamp < cutoff) {
            self.turns.pop_front();
        }
    }
}

/// Arena of live sessions keyed by id.
pub struct SessionStore {
    max_turns: usize,
    ttl: Duration,
    max_turn_age: Duration,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            max_turns: config.max_turns.max(1),
            ttl: to_delta(config.ttl()),
            max_turn_age: to_delta(config.max_turn_age()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Append a turn, creating the session on first use.
    ///
    /// Refreshes the sliding expiry and returns the number of retained turns.
    pub async fn append(
        &self,
        session_id: &SessionId,
        owner: &UserId,
        turn: Turn,
    ) -> Result<usize, SessionError> {
        self.append_at(session_id, owner, turn, Utc::now()).await
    }

    /// [`append`](Self::append) with an explicit clock reading.
    pub async fn append_at(
        &self,
        session_id: &SessionId,
        owner: &UserId,
        turn: Turn,
        now: DateTime<Utc>,
    ) -> Result<usize, SessionError> {
        let slot = match self.live_slot(session_id, now).await {
            Some(slot) => slot,
            None => {
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| {
                        debug!(session = %session_id, user = %owner, "Session created");
                        Arc::new(SessionSlot {
                            owner: owner.clone(),
                            state: Mutex::new(SessionState {
                                turns: VecDeque::new(),
                                expires_at: now + self.ttl,
                                appended: 0,
                                summary: None,
                            }),
                        })
                    })
                    .clone()
            }
        };

        if slot.owner != *owner {
            return Err(SessionError::OwnerMismatch {
                session: session_id.to_string(),
                user: owner.to_string(),
            });
        }

        let mut state = slot.state.lock().await;
        state.turns.push_back(turn);
        state.appended += 1;
        state.evict(now, self.max_turns, self.max_turn_age);
        state.expires_at = now + self.ttl;
        Ok(state.turns.len())
    }

    /// Turns of a live session, oldest first.
    pub async fn get(&self, session_id: &SessionId) -> Result<Vec<Turn>, SessionError> {
        self.get_at(session_id, Utc::now()).await
    }

    pub async fn get_at(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Turn>, SessionError> {
        let slot = self
            .live_slot(session_id, now)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let mut state = slot.state.lock().await;
        state.evict(now, self.max_turns, self.max_turn_age);
        Ok(state.turns.iter().cloned().collect())
    }

    /// Turns of a live session, provided `user_id` owns it.
    pub async fn get_owned(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Vec<Turn>, SessionError> {
        let now = Utc::now();
        let slot = self.owned_slot(session_id, user_id, now).await?;
        let mut state = slot.state.lock().await;
        state.evict(now, self.max_turns, self.max_turn_age);
        Ok(state.turns.iter().cloned().collect())
    }

    /// Summary of a live session owned by `user_id`, if one was written.
    pub async fn summary(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Option<SessionSummary>, SessionError> {
        let slot = self.owned_slot(session_id, user_id, Utc::now()).await?;
        let state = slot.state.lock().await;
        Ok(state.summary.clone())
    }

    pub async fn summary_progress(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<SummaryProgress, SessionError> {
        let slot = self.owned_slot(session_id, user_id, Utc::now()).await?;
        let state = slot.state.lock().await;
        Ok(SummaryProgress {
            appended: state.appended,
            summary: state.summary.clone(),
        })
    }

    /// Store a summary covering the first `covered` appended turns.
    ///
    /// A summary older than the stored one is ignored. Returns whether it
    /// was stored.
    pub async fn set_summary(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        text: impl Into<String>,
        covered: u64,
    ) -> Result<bool, SessionError> {
        let now = Utc::now();
        let slot = self.owned_slot(session_id, user_id, now).await?;
        let mut state = slot.state.lock().await;
        if state.summary.as_ref().is_some_and(|s| s.covered >= covered) {
            return Ok(false);
        }
        state.summary = Some(SessionSummary {
            text: text.into(),
            covered: covered.min(state.appended),
            updated_at: now,
        });
        debug!(session = %session_id, covered, "Session summary updated");
        Ok(true)
    }

    /// Owner of a live session.
    pub async fn owner(&self, session_id: &SessionId) -> Result<UserId, SessionError> {
        self.live_slot(session_id, Utc::now())
            .await
            .map(|slot| slot.owner.clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Drop a session. Returns whether it existed.
    pub async fn remove(&self, session_id: &SessionId) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Drop every session owned by `user_id`. Returns how many were removed.
    pub async fn purge_user(&self, user_id: &UserId) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, slot| slot.owner != *user_id);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(user = %user_id, removed, "Purged user sessions");
        }
        removed
    }

    /// Number of tracked sessions (expired ones linger until next touched).
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn owned_slot(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Arc<SessionSlot>, SessionError> {
        let slot = self
            .live_slot(session_id, now)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if slot.owner != *user_id {
            return Err(SessionError::OwnerMismatch {
                session: session_id.to_string(),
                user: user_id.to_string(),
            });
        }
        Ok(slot)
    }

    /// Look up a slot, removing it if it has expired.
    async fn live_slot(&self, session_id: &SessionId, now: DateTime<Utc>) -> Option<Arc<SessionSlot>> {
        let slot = self.sessions.read().await.get(session_id).cloned()?;
        if !slot.state.lock().await.is_expired(now) {
            return Some(slot);
        }

        let mut sessions = self.sessions.write().await;
        if sessions.get(session_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            sessions.remove(session_id);
            debug!(session = %session_id, "Session expired");
        }
        None
    }
}

/// Config durations are bounded, so the conversion cannot overflow.
fn to_delta(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}
