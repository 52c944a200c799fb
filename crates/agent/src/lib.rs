//! The conversational side of TaskMind.
//!
//! 1. **Append** the user's message to its session
//! 2. **Assemble** a hybrid context window (session turns + vector memory)
//! 3. **Select** a system prompt variant from keyword and tool signals
//! 4. **Invoke** the configured language model
//! 5. **Record** the reply in the session and both turns in long-term memory
//! 6. **Summarize** the session every `session.summary_every` turns

pub mod chat;
pub mod context;
pub mod prompt;
pub mod summary;

pub use chat::{ChatEngine, ChatReply, ErasureReport};
pub use context::{
    AssembleRequest, ContextAssembler, ContextItem, ContextWindow, Degradation, Origin,
};
pub use prompt::{PromptVariant, Signals, ToolIntent, select};
pub use summary::SessionSummarizer;
