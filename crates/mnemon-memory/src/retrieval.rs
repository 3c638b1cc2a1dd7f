//! Similarity ranking for queries.

use crate::vector::cosine_similarity;
use mnemon_types::memory::{MemoryRecord, ScoredRecord, Sector};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Combines similarity and record state into a single rank key (higher is better).
pub trait RankPolicy: Send + Sync {
    fn rank(&self, similarity: f32, record: &MemoryRecord) -> f32;
}

/// `similarity * (0.5 + 0.5 * activation)`: activation dampens a strong match
/// but never zeroes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivationDampedRank;

impl RankPolicy for ActivationDampedRank {
    fn rank(&self, similarity: f32, record: &MemoryRecord) -> f32 {
        similarity * (0.5 + 0.5 * record.activation_score.clamp(0.0, 1.0))
    }
}

/// Best cosine similarity over the sectors the record shares with the query.
///
/// Returns `None` when the record has no vector in any queried sector.
pub fn best_similarity(
    query: &HashMap<Sector, Vec<f32>>,
    record: &MemoryRecord,
) -> Option<f32> {
    record
        .sectors
        .iter()
        .filter_map(|sector| {
            let q = query.get(sector)?;
            let v = record.embeddings.get(sector)?;
            Some(cosine_similarity(q, v))
        })
        .max_by(f32::total_cmp)
}

/// Result order: rank descending, then most recently accessed, then id.
pub fn compare_scored(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.rank
        .total_cmp(&a.rank)
        .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Score `candidates` against the query vectors and keep the best `limit`.
pub fn rank(
    query: &HashMap<Sector, Vec<f32>>,
    candidates: Vec<MemoryRecord>,
    policy: &dyn RankPolicy,
    limit: usize,
) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = candidates
        .into_iter()
        .filter_map(|record| {
            let similarity = best_similarity(query, &record)?;
            let rank = policy.rank(similarity, &record);
            Some(ScoredRecord {
                record,
                similarity,
                rank,
            })
        })
        .collect();
    scored.sort_by(compare_scored);
    scored.truncate(limit);
    scored
}
