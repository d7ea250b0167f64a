//! ATLAS Embedding Worker
//!
//! Backfills the vector index from the application's relational tables and
//! keeps single rows current as they change.

pub mod processor;

pub use processor::{BulkEmbedError, BulkEmbedder, BulkSummary};
