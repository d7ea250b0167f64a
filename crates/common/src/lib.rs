//! ATLAS Common Library
//!
//! Shared code for the ATLAS retrieval services:
//! - Configuration and error types
//! - Embedding and reranking client abstractions
//! - Vector index abstraction (Qdrant, in-memory)
//! - Relational content source and settings store
//! - Metrics helpers

pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod loader;
pub mod metrics;
pub mod reranking;
pub mod settings;
pub mod vector;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use reranking::Reranker;
pub use settings::{RetrievalTuning, SettingsProvider};
pub use vector::{Candidate, VectorIndex};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
