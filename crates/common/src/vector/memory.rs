//! Brute-force in-memory vector index

use super::{cosine_similarity, Candidate, Payload, VectorIndex, VectorPoint};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct StoredPoint {
    vector: Vec<f32>,
    payload: Payload,
}

type Collection = HashMap<String, StoredPoint>;

/// Vector index holding every collection in process memory
pub struct InMemoryVectorIndex {
    dimension: usize,
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of points in a collection, zero when it does not exist
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, collection: &str) -> bool {
        self.len(collection).await == 0
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(AppError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

fn missing(name: &str) -> AppError {
    AppError::CollectionNotFound {
        name: name.to_string(),
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn recreate_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .await
            .insert(name.to_string(), Collection::new());
        Ok(())
    }

    async fn upsert_batch(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        for point in &points {
            self.check_vector(&point.vector)?;
        }

        let mut collections = self.collections.write().await;
        let target = collections.get_mut(collection).ok_or_else(|| missing(collection))?;
        for point in points {
            target.insert(
                point.id,
                StoredPoint {
                    vector: point.vector,
                    payload: point.payload,
                },
            );
        }
        Ok(())
    }

    async fn point_exists(&self, collection: &str, id: &str) -> Result<bool> {
        let collections = self.collections.read().await;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;
        Ok(target.contains_key(id))
    }

    async fn search(&self, collection: &str, vector: &[f32], limit: usize) -> Result<Vec<Candidate>> {
        self.check_vector(vector)?;

        let collections = self.collections.read().await;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;

        let mut scored: Vec<(&String, f32)> = target
            .iter()
            .map(|(id, point)| (id, cosine_similarity(vector, &point.vector)))
            .collect();
        // Ties broken by id so results are stable across runs
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(id, score)| Candidate::new(id.clone(), score, target[id].payload.clone()))
            .collect())
    }

    async fn get_payload(&self, collection: &str, id: &str) -> Result<Option<Payload>> {
        let collections = self.collections.read().await;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;
        Ok(target.get(id).map(|p| p.payload.clone()))
    }

    async fn set_payload(&self, collection: &str, id: &str, partial: Payload) -> Result<()> {
        let mut collections = self.collections.write().await;
        let target = collections.get_mut(collection).ok_or_else(|| missing(collection))?;
        let point = target.get_mut(id).ok_or_else(|| AppError::PointNotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        point.payload.extend(partial);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> InMemoryVectorIndex {
        let index = InMemoryVectorIndex::new(2);
        index.ensure_collection("documents").await.unwrap();
        index
            .upsert_batch(
                "documents",
                vec![
                    VectorPoint::new("x", vec![1.0, 0.0]).with_payload("text", json!("east")),
                    VectorPoint::new("y", vec![0.0, 1.0]).with_payload("text", json!("north")),
                    VectorPoint::new("z", vec![0.7, 0.7]).with_payload("text", json!("between")),
                ],
            )
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let index = seeded().await;
        let results = index.search("documents", &[1.0, 0.1], 2).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "x");
        assert_eq!(results[1].id, "z");
        assert!(results[0].score >= results[1].score);
        assert_eq!(results[0].text(), "east");
    }

    #[tokio::test]
    async fn test_upsert_replaces_point() {
        let index = seeded().await;
        index
            .upsert("documents", VectorPoint::new("x", vec![0.0, 1.0]))
            .await
            .unwrap();

        assert_eq!(index.len("documents").await, 3);
        let payload = index.get_payload("documents", "x").await.unwrap().unwrap();
        assert!(payload.get("text").is_none());
    }

    #[tokio::test]
    async fn test_set_payload_merges() {
        let index = seeded().await;
        let mut partial = Payload::new();
        partial.insert("salience".into(), json!(0.55));
        index.set_payload("documents", "y", partial).await.unwrap();

        let payload = index.get_payload("documents", "y").await.unwrap().unwrap();
        assert_eq!(payload["salience"], json!(0.55));
        assert_eq!(payload["text"], json!("north"));
    }

    #[tokio::test]
    async fn test_missing_collection_and_point() {
        let index = seeded().await;

        let err = index.search("nope", &[1.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, AppError::CollectionNotFound { .. }));

        let err = index
            .set_payload("documents", "ghost", Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PointNotFound { .. }));

        assert!(!index.point_exists("documents", "ghost").await.unwrap());
        assert!(index.get_payload("documents", "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dimension_checked() {
        let index = seeded().await;
        let err = index
            .upsert("documents", VectorPoint::new("bad", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::DimensionMismatch { expected: 2, actual: 3 }
        ));
    }

    #[tokio::test]
    async fn test_recreate_clears() {
        let index = seeded().await;
        index.recreate_collection("documents").await.unwrap();
        assert!(index.is_empty("documents").await);
    }
}
