//! Task detection for TaskMind.
//!
//! Incoming email → [`preprocess`](preprocess::preprocess) →
//! [`TaskAnalyzer`] → [`TicketSequencer`] → [`TaskStore`](taskmind_core::TaskStore).
//!
//! Two stores are provided: [`SqliteTaskStore`] for real use and
//! [`InMemoryTaskStore`] for tests and dry runs.

pub mod analyze;
pub mod pipeline;
pub mod preprocess;
pub mod retry;
pub mod sequencer;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use analyze::{Analysis, AnalyzeError, TaskAnalyzer, resolve_due_date};
pub use pipeline::{DiscardReason, IncomingMessage, TaskOutcome, TaskPipeline};
pub use preprocess::preprocess;
pub use retry::{RetryError, RetryPolicy};
pub use sequencer::{TicketSequencer, format_ticket};
pub use store::{InMemoryTaskStore, SqliteTaskStore};
