//! Rolling session summaries.
//!
//! Every `session.summary_every` appended turns the model folds the turns
//! written since the last refresh into the previous summary. The result is
//! stored on the session and offered to the assembler as a low-priority
//! context item.

use std::sync::Arc;
use std::time::Duration;

use taskmind_config::AppConfig;
use taskmind_core::error::Error;
use taskmind_core::message::{SessionId, UserId};
use taskmind_core::provider::{LanguageModel, ModelRequest, PromptMessage};
use taskmind_memory::SessionStore;
use tracing::{debug, info};

const SUMMARY_PROMPT: &str = "You maintain a running summary of a conversation between a user \
and their assistant. Merge the new turns into the previous summary. Keep key points, decisions \
and action items. Reply with the summary only, without any preamble.";

pub struct SessionSummarizer {
    sessions: Arc<SessionStore>,
    model: Arc<dyn LanguageModel>,
    every: usize,
    timeout: Duration,
}

impl SessionSummarizer {
    pub fn new(
        sessions: Arc<SessionStore>,
        model: Arc<dyn LanguageModel>,
        every: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            model,
            every,
            timeout,
        }
    }

    pub fn from_config(
        sessions: Arc<SessionStore>,
        model: Arc<dyn LanguageModel>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            sessions,
            model,
            config.session.summary_every,
            config.provider.chat_timeout(),
        )
    }

    /// Refresh the summary when enough turns have piled up since the last
    /// one. Returns whether a new summary was stored.
    pub async fn refresh_if_due(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<bool, Error> {
        if self.every == 0 {
            return Ok(false);
        }
        let progress = self.sessions.summary_progress(session_id, user_id).await?;
        let pending = progress.pending();
        if pending < self.every as u64 {
            return Ok(false);
        }

        let turns = self.sessions.get_owned(session_id, user_id).await?;
        let fresh = usize::try_from(pending).unwrap_or(usize::MAX).min(turns.len());
        let mut text = String::new();
        if let Some(previous) = &progress.summary {
            text.push_str(&format!("Previous summary:\n{}\n\n", previous.text));
        }
        text.push_str("New conversation turns:\n");
        for turn in &turns[turns.len() - fresh..] {
            if !turn.content.trim().is_empty() {
                text.push_str(&format!("{}: {}\n", turn.role, turn.content));
            }
        }

        let request = ModelRequest::new(SUMMARY_PROMPT, vec![PromptMessage::user(text)], self.timeout)
            .with_temperature(0.0);
        debug!(session = %session_id, turns = fresh, "Summarizing session");
        let response = self.model.invoke(request).await?;
        let summary = response.text.trim();
        if summary.is_empty() {
            return Ok(false);
        }

        let stored = self
            .sessions
            .set_summary(session_id, user_id, summary, progress.appended)
            .await?;
        if stored {
            info!(session = %session_id, covered = progress.appended, "Session summary refreshed");
        }
        Ok(stored)
    }
}
