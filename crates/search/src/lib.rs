//! ATLAS Search
//!
//! Two-stage retrieval with salience feedback:
//! - ANN search over the vector index, reordered by a cross-encoder
//! - Salience write-back from rerank scores and from usage signals
//! - Keyword-overlap usage estimation for generated answers
//! - Prompt context assembly for chat layers

pub mod background;
pub mod context;
pub mod retrieval;
pub mod salience;
pub mod usage;

pub use context::RagContext;
pub use retrieval::{SearchMode, SearchService};
pub use salience::{SalienceEngine, SalienceReport};
pub use usage::{compute_usage, UsageScoredHit};
