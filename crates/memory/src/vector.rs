//! Vector similarity and ranking utilities.

use std::cmp::Ordering;

use taskmind_core::memory::{MemoryRecord, ScoredRecord};
use taskmind_core::message::UserId;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the lengths differ or either vector is empty or all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Score the live records of `user_id` against `query` and keep the best `k`.
///
/// Records scoring below `min_score` are dropped. Order is score descending,
/// then newest first, then id ascending, so equal inputs always rank equally.
pub fn rank_records<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    query: &[f32],
    k: usize,
    min_score: f32,
    user_id: &UserId,
) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = records
        .into_iter()
        .filter(|r| r.user_id == *user_id && !r.is_deleted())
        .filter_map(|r| {
            let score = cosine_similarity(&r.embedding, query);
            (score >= min_score).then(|| ScoredRecord {
                record: r.clone(),
                score,
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    scored.truncate(k);
    scored
}
