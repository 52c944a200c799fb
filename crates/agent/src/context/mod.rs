//! Hybrid context assembly.
//!
//! Merges the live session (short-term) with vector memory matches
//! (long-term) into one ranked window bounded by a token budget.

pub mod assembler;
pub mod token;

pub use assembler::{
    AssembleRequest, ContextAssembler, ContextItem, ContextWindow, Degradation, Origin,
};
