//! # TaskMind Core
//!
//! Domain types, traits, and error definitions for the TaskMind hybrid
//! context and task-detection engine. This crate has **zero framework
//! dependencies**; it defines the domain model that all other crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator the engine consumes (language model, embedding
//! function, vector index, task persistence) is a trait here. Implementations
//! live in their respective crates, so tests swap in scripted stubs and the
//! dependency graph points inward on core.

pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod task;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ErrorKind, Result};
pub use memory::{MemoryIndex, MemoryRecord, ScoredRecord};
pub use message::{Role, SessionId, Turn, UserId};
pub use provider::{
    Embedder, LanguageModel, ModelRequest, ModelResponse, PromptMessage, ResponseSchema,
};
pub use task::{Priority, Task, TaskStatus, TaskStore, UpsertOutcome};
