//! Two-stage retrieval
//!
//! Stage one casts a wide ANN net over the vector index; stage two reorders
//! the candidates with a cross-encoder and narrows them to the requested
//! limit. Either stage can be skipped:
//! - `rerank = false` serves ANN order directly (bulk and background callers)
//! - a failing reranker degrades to ANN order instead of failing the search

mod merge;
mod two_stage;

pub use merge::merge_by_relevance;
pub use two_stage::SearchService;

use serde::{Deserialize, Serialize};

/// How a result list was ordered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Cosine similarity only
    Ann,
    /// Cross-encoder reordering of ANN candidates
    Rerank,
    /// Reranking was requested but failed
    AnnFallback,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Ann => "ann",
            SearchMode::Rerank => "rerank",
            SearchMode::AnnFallback => "ann_fallback",
        }
    }
}
