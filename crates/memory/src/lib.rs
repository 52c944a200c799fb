//! Memory system implementations for TaskMind.
//!
//! - [`SessionStore`]: short-term, per-session ring buffers of recent turns
//!   with sliding expiry.
//! - [`FileVectorIndex`]: long-term, user-scoped vector memory persisted as a
//!   JSON-lines operation log plus a checksummed snapshot.

pub mod index;
pub mod session;
pub mod vector;

pub use index::{FileVectorIndex, IndexOptions, IndexStats};
pub use session::{SessionStore, SessionSummary, SummaryProgress};
pub use vector::{cosine_similarity, rank_records};
