//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token, which is close
//! enough for BPE tokenizers on English text and keeps budgets predictable.

/// Tokens charged per context item for role name and delimiters.
pub const ITEM_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimate tokens for one context item including per-item overhead.
pub fn estimate_item_tokens(text: &str) -> usize {
    ITEM_OVERHEAD + estimate_tokens(text)
}
