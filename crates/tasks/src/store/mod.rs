//! `TaskStore` implementations.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;
