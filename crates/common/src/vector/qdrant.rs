//! Qdrant REST backend
//!
//! Qdrant only accepts unsigned integers or UUIDs as point ids, so row keys
//! that are not already UUIDs are hashed (SHA-256, first 16 bytes) into one.
//! The original key is kept in the `key` payload field and is what callers
//! see as [`Candidate::id`].

use super::{payload_fields, Candidate, Payload, VectorIndex, VectorPoint};
use crate::config::VectorConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Map a row key onto a Qdrant point id
pub fn point_uuid(key: &str) -> Uuid {
    if let Ok(uuid) = Uuid::parse_str(key) {
        return uuid;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Vector index stored in a Qdrant server
pub struct QdrantIndex {
    client: reqwest::Client,
    base_url: String,
    prefix: String,
    dimension: usize,
}

#[derive(Serialize)]
struct PointStruct {
    id: String,
    vector: Vec<f32>,
    payload: Payload,
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Deserialize)]
struct RetrievedPoint {
    #[serde(default)]
    payload: Option<Payload>,
}

impl QdrantIndex {
    pub fn new(config: &VectorConfig, dimension: usize) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key.trim()).map_err(|e| AppError::Configuration {
                message: format!("Invalid vector.api_key: {}", e),
            })?;
            headers.insert("api-key", value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create Qdrant client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            prefix: config.collection_prefix.clone(),
            dimension,
        })
    }

    /// Physical collection name for a logical one
    pub fn physical_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.prefix, name)
        }
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/collections/{}", self.base_url, self.physical_name(name))
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.collection_url(name))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(status_error(s, response.text().await.unwrap_or_default())),
        }
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        let body = json!({
            "vectors": { "size": self.dimension, "distance": "Cosine" }
        });
        let response = self
            .client
            .put(self.collection_url(name))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(name, response).await?;
        info!(
            collection = %self.physical_name(name),
            dimension = self.dimension,
            "Created vector collection"
        );
        Ok(())
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

fn transport_error(e: reqwest::Error) -> AppError {
    AppError::VectorStore {
        message: format!("Request failed: {}", e),
    }
}

fn status_error(status: StatusCode, body: String) -> AppError {
    AppError::VectorStore {
        message: format!("Qdrant error {}: {}", status, body),
    }
}

/// Turn a non-success response into an error, mapping 404 to a missing collection
async fn check_status(collection: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(AppError::CollectionNotFound {
            name: collection.to_string(),
        });
    }
    Err(status_error(status, response.text().await.unwrap_or_default()))
}

/// The caller-facing id: the stored key, else Qdrant's own id
fn candidate_id(id: &Value, payload: &Payload) -> String {
    payload
        .get(payload_fields::KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_collection(&self, name: &str) -> Result<()> {
        if self.collection_exists(name).await? {
            debug!(collection = %self.physical_name(name), "Collection exists");
            return Ok(());
        }
        self.create_collection(name).await
    }

    async fn recreate_collection(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.collection_url(name))
            .send()
            .await
            .map_err(transport_error)?;
        // Deleting an absent collection is fine
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            let status = response.status();
            return Err(status_error(status, response.text().await.unwrap_or_default()));
        }
        self.create_collection(name).await
    }

    async fn upsert_batch(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut body = Vec::with_capacity(points.len());
        for point in points {
            self.check_vector(&point.vector)?;
            let mut payload = point.payload;
            payload.insert(payload_fields::KEY.to_string(), Value::String(point.id.clone()));
            body.push(PointStruct {
                id: point_uuid(&point.id).to_string(),
                vector: point.vector,
                payload,
            });
        }

        let count = body.len();
        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url(collection)))
            .json(&json!({ "points": body }))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(collection, response).await?;

        debug!(collection = %collection, count, "Upserted points");
        Ok(())
    }

    async fn point_exists(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.get_payload(collection, id).await?.is_some())
    }

    async fn search(&self, collection: &str, vector: &[f32], limit: usize) -> Result<Vec<Candidate>> {
        self.check_vector(vector)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url(collection)))
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(collection, response).await?;

        let parsed: QdrantResponse<Vec<ScoredPoint>> =
            response.json().await.map_err(|e| AppError::VectorStore {
                message: format!("Failed to parse search response: {}", e),
            })?;

        Ok(parsed
            .result
            .into_iter()
            .map(|point| {
                let payload = point.payload.unwrap_or_default();
                Candidate::new(candidate_id(&point.id, &payload), point.score, payload)
            })
            .collect())
    }

    async fn get_payload(&self, collection: &str, id: &str) -> Result<Option<Payload>> {
        let response = self
            .client
            .post(format!("{}/points", self.collection_url(collection)))
            .json(&json!({
                "ids": [point_uuid(id).to_string()],
                "with_payload": true,
                "with_vector": false,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(collection, response).await?;

        let parsed: QdrantResponse<Vec<RetrievedPoint>> =
            response.json().await.map_err(|e| AppError::VectorStore {
                message: format!("Failed to parse retrieve response: {}", e),
            })?;

        Ok(parsed
            .result
            .into_iter()
            .next()
            .map(|p| p.payload.unwrap_or_default()))
    }

    async fn set_payload(&self, collection: &str, id: &str, partial: Payload) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/points/payload?wait=true", self.collection_url(collection)))
            .json(&json!({
                "payload": partial,
                "points": [point_uuid(id).to_string()],
            }))
            .send()
            .await
            .map_err(transport_error)?;

        // Qdrant answers 404 for both a missing collection and a missing point
        if response.status() == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            if body.contains("point") || body.contains("Point") {
                return Err(AppError::PointNotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            return Err(AppError::CollectionNotFound {
                name: collection.to_string(),
            });
        }
        check_status(collection, response).await?;
        Ok(())
    }
}
