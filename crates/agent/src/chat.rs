//! The chat path.
//!
//! message → assemble context → select prompt → model call → record both
//! turns in the session and in long-term memory → refresh the rolling
//! session summary when it is due.
//!
//! Long-term memory and the summary are best effort on this path: a failing
//! index degrades context and skips remembering, a failing summary call
//! keeps the previous summary, and the user still gets an answer.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use taskmind_config::AppConfig;
use taskmind_core::error::Error;
use taskmind_core::memory::{MemoryIndex, MemoryRecord};
use taskmind_core::message::{SessionId, Turn, UserId};
use taskmind_core::provider::{Embedder, LanguageModel, ModelRequest};
use taskmind_memory::SessionStore;
use tracing::{debug, info, warn};

use crate::context::{AssembleRequest, ContextAssembler, ContextWindow};
use crate::prompt::{self, PromptVariant, Signals, ToolIntent};
use crate::summary::SessionSummarizer;

/// The answer to one chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub text: String,
    pub variant: PromptVariant,
    pub model: String,
    /// The context the model saw.
    pub window: ContextWindow,
}

/// What [`ChatEngine::forget_user`] erased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErasureReport {
    pub sessions: usize,
    pub memories: usize,
}

pub struct ChatEngine {
    sessions: Arc<SessionStore>,
    index: Arc<dyn MemoryIndex>,
    assembler: ContextAssembler,
    summarizer: SessionSummarizer,
    model: Arc<dyn LanguageModel>,
    token_budget: usize,
    temperature: f32,
    model_timeout: Duration,
}

impl ChatEngine {
    pub fn new(
        sessions: Arc<SessionStore>,
        index: Arc<dyn MemoryIndex>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        config: &AppConfig,
    ) -> Self {
        let assembler =
            ContextAssembler::from_config(sessions.clone(), index.clone(), embedder, config);
        let summarizer = SessionSummarizer::from_config(sessions.clone(), model.clone(), config);
        Self {
            sessions,
            index,
            assembler,
            summarizer,
            model,
            token_budget: config.context.token_budget,
            temperature: config.provider.temperature,
            model_timeout: config.provider.chat_timeout(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Answer `text` within `session_id`.
    pub async fn respond(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        text: &str,
    ) -> Result<ChatReply, Error> {
        self.respond_with(session_id, user_id, text, None).await
    }

    /// Like [`respond`](Self::respond), with an explicit tool intent.
    pub async fn respond_with(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        text: &str,
        intent: Option<ToolIntent>,
    ) -> Result<ChatReply, Error> {
        let user_turn = Turn::user(text);
        let user_record = MemoryRecord::from_turn(user_id.clone(), session_id.clone(), &user_turn);
        let user_turn = user_turn.with_memory_ref(&user_record.id);
        self.sessions.append(session_id, user_id, user_turn).await?;

        let window = self
            .assembler
            .assemble(&AssembleRequest {
                session_id: session_id.clone(),
                user_id: user_id.clone(),
                query_text: text.to_string(),
                token_budget: self.token_budget,
            })
            .await;

        let mut signals = Signals::detect(text);
        if let Some(intent) = intent {
            signals = signals.with_tool_intent(intent);
        }
        let variant = prompt::select(&window, &signals);

        let (system, messages) = window.render(variant.system_prompt());
        let request = ModelRequest::new(system, messages, self.model_timeout)
            .with_temperature(self.temperature);
        debug!(session = %session_id, variant = %variant, items = window.items.len(), "Invoking model");
        let response = self.model.invoke(request).await?;

        let assistant_turn = Turn::assistant(response.text.clone());
        let assistant_record =
            MemoryRecord::from_turn(user_id.clone(), session_id.clone(), &assistant_turn);
        let assistant_turn = assistant_turn.with_memory_ref(&assistant_record.id);
        self.sessions.append(session_id, user_id, assistant_turn).await?;

        self.remember(user_record).await;
        self.remember(assistant_record).await;
        if let Err(e) = self.summarizer.refresh_if_due(session_id, user_id).await {
            warn!(session = %session_id, error = %e, "Failed to refresh session summary");
        }

        Ok(ChatReply {
            text: response.text,
            variant,
            model: response.model,
            window,
        })
    }

    /// Append a turn that did not come from the chat exchange (e.g. a tool
    /// result). Only user and assistant turns reach long-term memory.
    pub async fn record_turn(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        turn: Turn,
    ) -> Result<(), Error> {
        if turn.role.is_conversational() {
            let record = MemoryRecord::from_turn(user_id.clone(), session_id.clone(), &turn);
            let turn = turn.with_memory_ref(&record.id);
            self.sessions.append(session_id, user_id, turn).await?;
            self.remember(record).await;
        } else {
            self.sessions.append(session_id, user_id, turn).await?;
        }
        Ok(())
    }

    /// Erase a user's sessions and long-term memories.
    pub async fn forget_user(&self, user_id: &UserId) -> Result<ErasureReport, Error> {
        let sessions = self.sessions.purge_user(user_id).await;
        let memories = self.index.remove_user(user_id).await?;
        info!(user = %user_id, sessions, memories, "User data erased");
        Ok(ErasureReport { sessions, memories })
    }

    async fn remember(&self, record: MemoryRecord) {
        if record.text.trim().is_empty() {
            return;
        }
        if let Err(e) = self.index.upsert(record).await {
            warn!(error = %e, "Failed to store memory record");
        }
    }
}
