//! Cross-collection result merging

use atlas_common::vector::Candidate;
use std::cmp::Ordering;

/// Concatenate per-collection results, sort by relevance, keep `limit`.
///
/// Reranked lists sort by `rerank_score`, ANN-only lists by `score`.
/// Candidates without a rerank score sort as 0 in a reranked merge.
pub fn merge_by_relevance(lists: Vec<Vec<Candidate>>, reranked: bool, limit: usize) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = lists.into_iter().flatten().collect();

    let key = |c: &Candidate| {
        if reranked {
            c.rerank_score.unwrap_or(0.0)
        } else {
            c.score
        }
    };
    merged.sort_by(|a, b| key(b).partial_cmp(&key(a)).unwrap_or(Ordering::Equal));
    merged.truncate(limit);
    merged
}
