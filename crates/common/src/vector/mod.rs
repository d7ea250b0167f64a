//! Vector index abstraction
//!
//! Named collections of points keyed by the id of their owning row, searched
//! by cosine similarity. Payloads are open JSON maps; only the salience
//! fields are ever mutated after insertion, through [`VectorIndex::set_payload`].
//!
//! Backends:
//! - [`QdrantIndex`]: Qdrant over its REST API
//! - [`InMemoryVectorIndex`]: brute-force cosine search for tests and dev

mod memory;
mod qdrant;

pub use memory::InMemoryVectorIndex;
pub use qdrant::QdrantIndex;

use crate::config::{VectorBackend, VectorConfig};
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Point payload
pub type Payload = serde_json::Map<String, Value>;

/// Well-known payload keys
pub mod payload_fields {
    /// Passage text (truncated to the embedding ceiling)
    pub const TEXT: &str = "text";
    /// Id of the owning row when it differs from the backend point id
    pub const KEY: &str = "key";
    pub const TITLE: &str = "title";
    /// Title field used by message points
    pub const CONV_TITLE: &str = "conv_title";
    pub const SALIENCE: &str = "salience";
    pub const LAST_RETRIEVED: &str = "last_retrieved";
    pub const LAST_USAGE_SIGNAL: &str = "last_usage_signal";
}

/// A point ready to be written to the index
#[derive(Debug, Clone)]
pub struct VectorPoint {
    /// Id of the owning row, unique within its collection
    pub id: String,
    /// Document-kind embedding
    pub vector: Vec<f32>,
    /// Payload data
    pub payload: Payload,
}

impl VectorPoint {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            payload: Payload::new(),
        }
    }

    /// Add a payload field
    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Merge a whole map into the payload
    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.payload.extend(metadata);
        self
    }
}

/// Ephemeral search result for a single query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    /// Id of the indexed point (owning row id)
    pub id: String,

    /// ANN cosine similarity, higher is more similar
    pub score: f32,

    /// Cross-encoder relevance in [0, 1], set after reranking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,

    /// Collection the candidate came from, set when merging collections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_collection: Option<String>,

    /// All payload fields, copied through
    #[serde(flatten)]
    pub payload: Payload,
}

impl Candidate {
    pub fn new(id: impl Into<String>, score: f32, payload: Payload) -> Self {
        Self {
            id: id.into(),
            score,
            rerank_score: None,
            source_collection: None,
            payload,
        }
    }

    /// Stored passage text
    pub fn text(&self) -> &str {
        self.payload_str(payload_fields::TEXT).unwrap_or("")
    }

    /// Title, falling back to the conversation title of message points
    pub fn title(&self) -> &str {
        self.payload_str(payload_fields::TITLE)
            .filter(|t| !t.is_empty())
            .or_else(|| self.payload_str(payload_fields::CONV_TITLE))
            .unwrap_or("")
    }

    /// Persisted salience, if the point has been scored before
    pub fn salience(&self) -> Option<f64> {
        self.payload.get(payload_fields::SALIENCE).and_then(Value::as_f64)
    }

    /// Rerank score when present, otherwise the ANN score
    pub fn relevance(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Cosine similarity; zero when either vector has no magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Persistent collection store keyed by point id
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Fixed vector dimension of every collection
    fn dimension(&self) -> usize;

    /// Create the collection if it does not exist (cosine distance)
    async fn ensure_collection(&self, name: &str) -> Result<()>;

    /// Drop and recreate the collection, discarding every point
    async fn recreate_collection(&self, name: &str) -> Result<()>;

    /// Insert or replace a single point
    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()> {
        self.upsert_batch(collection, vec![point]).await
    }

    /// Insert or replace a batch of points
    async fn upsert_batch(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Whether a point with this id is indexed
    async fn point_exists(&self, collection: &str, id: &str) -> Result<bool>;

    /// The `limit` nearest points, highest similarity first, payload attached
    async fn search(&self, collection: &str, vector: &[f32], limit: usize) -> Result<Vec<Candidate>>;

    /// Current payload of a point, `None` when the point is absent
    async fn get_payload(&self, collection: &str, id: &str) -> Result<Option<Payload>>;

    /// Merge `partial` into the point's payload
    async fn set_payload(&self, collection: &str, id: &str, partial: Payload) -> Result<()>;
}

/// Create a vector index based on configuration
pub fn create_index(config: &VectorConfig, dimension: usize) -> Result<Arc<dyn VectorIndex>> {
    match config.backend {
        VectorBackend::Qdrant => Ok(Arc::new(QdrantIndex::new(config, dimension)?)),
        VectorBackend::Memory => Ok(Arc::new(InMemoryVectorIndex::new(dimension))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_candidate_title_fallback() {
        let mut payload = Payload::new();
        payload.insert("conv_title".into(), json!("Morning chat"));
        let candidate = Candidate::new("m1", 0.8, payload);
        assert_eq!(candidate.title(), "Morning chat");
        assert_eq!(candidate.text(), "");
        assert!(candidate.salience().is_none());
    }

    #[test]
    fn test_candidate_serializes_flat() {
        let point = VectorPoint::new("p1", vec![]).with_payload("text", json!("apple pie"));
        let mut candidate = Candidate::new(point.id, 0.9, point.payload);
        candidate.source_collection = Some("documents".into());

        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["text"], "apple pie");
        assert_eq!(value["source_collection"], "documents");
        assert!(value.get("rerank_score").is_none());
    }
}
