//! Bulk embedding processor
//!
//! Walks a content source, filters out short rows and rows already indexed,
//! and embeds the rest in fixed-size batches. A failing batch is recorded
//! and the walk continues, so a rerun resumes where the last one stopped.

use atlas_common::config::{AppConfig, BulkConfig};
use atlas_common::db::{domain_key, ContentKind, ContentRow, ContentSource};
use atlas_common::embeddings::{truncate_chars, Embedder};
use atlas_common::errors::AppError;
use atlas_common::metrics;
use atlas_common::vector::{payload_fields, VectorIndex, VectorPoint};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Longest error message kept per failed batch
const ERROR_MESSAGE_CHARS: usize = 80;

/// Outcome of one bulk job
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BulkSummary {
    pub kind: String,
    pub embedded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// One entry per failed batch: `"{first_id}..{last_id}: {message}"`
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

/// Failures that stop a job before any row is processed
#[derive(Debug, thiserror::Error)]
pub enum BulkEmbedError {
    #[error("Content source error: {0}")]
    Source(String),

    #[error("Vector index error: {0}")]
    Index(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),
}

impl From<AppError> for BulkEmbedError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::EmbeddingError { .. }
            | AppError::EmbeddingTimeout { .. }
            | AppError::ModelUnavailable { .. }
            | AppError::DimensionMismatch { .. } => BulkEmbedError::Embedding(e.to_string()),
            AppError::VectorStore { .. }
            | AppError::CollectionNotFound { .. }
            | AppError::PointNotFound { .. } => BulkEmbedError::Index(e.to_string()),
            other => BulkEmbedError::Source(other.to_string()),
        }
    }
}

/// Embeds relational content into the vector index
pub struct BulkEmbedder {
    source: Arc<dyn ContentSource>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    config: BulkConfig,
    text_chars: usize,
}

impl BulkEmbedder {
    pub fn new(
        source: Arc<dyn ContentSource>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: &AppConfig,
    ) -> Self {
        Self {
            source,
            embedder,
            index,
            config: config.bulk.clone(),
            text_chars: config.embedding.max_chars,
        }
    }

    /// Whether a row is too short to be worth embedding.
    ///
    /// Messages are measured on their trimmed `Q:/A:` text and must reach
    /// `min_message_chars`; other kinds must exceed `min_content_chars`.
    fn too_short(&self, kind: ContentKind, text: &str) -> bool {
        match kind {
            ContentKind::Messages => text.trim().chars().count() < self.config.min_message_chars,
            _ => text.chars().count() <= self.config.min_content_chars,
        }
    }

    fn to_point(&self, row: ContentRow, vector: Vec<f32>) -> VectorPoint {
        let text = truncate_chars(&row.text, self.text_chars).to_string();
        VectorPoint::new(row.id, vector)
            .with_metadata(row.metadata)
            .with_payload(payload_fields::TEXT, json!(text))
    }

    async fn embed_batch(&self, collection: &str, rows: Vec<ContentRow>) -> Result<usize, AppError> {
        let texts: Vec<String> = rows.iter().map(|r| r.text.clone()).collect();
        let vectors = self.embedder.embed_documents(&texts).await?;
        if vectors.len() != rows.len() {
            return Err(AppError::EmbeddingError {
                message: format!("expected {} vectors, got {}", rows.len(), vectors.len()),
            });
        }

        let points: Vec<VectorPoint> = rows
            .into_iter()
            .zip(vectors)
            .map(|(row, vector)| self.to_point(row, vector))
            .collect();
        let count = points.len();
        self.index.upsert_batch(collection, points).await?;
        Ok(count)
    }

    /// Embed every pending row of one content kind
    #[instrument(skip(self))]
    pub async fn embed_kind(&self, kind: ContentKind) -> Result<BulkSummary, BulkEmbedError> {
        let started = Instant::now();
        let collection = kind.collection();
        self.index
            .ensure_collection(collection)
            .await
            .map_err(|e| BulkEmbedError::Index(e.to_string()))?;

        let rows = self
            .source
            .fetch_rows(kind)
            .await
            .map_err(|e| BulkEmbedError::Source(e.to_string()))?;

        let mut summary = BulkSummary {
            kind: kind.to_string(),
            ..Default::default()
        };

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            if self.too_short(kind, &row.text) {
                summary.skipped += 1;
                continue;
            }
            // An unreadable index entry is treated as missing and re-embedded
            let exists = match self.index.point_exists(collection, &row.id).await {
                Ok(exists) => exists,
                Err(e) => {
                    debug!(id = %row.id, error = %e, "Existence check failed");
                    false
                }
            };
            if exists {
                summary.skipped += 1;
            } else {
                pending.push(row);
            }
        }

        info!(
            collection = %collection,
            pending = pending.len(),
            skipped = summary.skipped,
            "Starting bulk embedding"
        );

        let batch_size = self.config.batch_size.max(1);
        let mut iter = pending.into_iter().peekable();
        while iter.peek().is_some() {
            let batch: Vec<ContentRow> = iter.by_ref().take(batch_size).collect();
            let size = batch.len();
            let span = format!(
                "{}..{}",
                batch.first().map(|r| r.id.as_str()).unwrap_or_default(),
                batch.last().map(|r| r.id.as_str()).unwrap_or_default()
            );

            match self.embed_batch(collection, batch).await {
                Ok(count) => {
                    summary.embedded += count;
                    metrics::record_bulk_batch(kind.as_str(), count, true);
                    debug!(batch = %span, count, embedded = summary.embedded, "Batch embedded");
                }
                Err(e) => {
                    error!(batch = %span, error = %e, "Batch failed");
                    summary.failed += size;
                    let message = e.to_string();
                    summary
                        .errors
                        .push(format!("{}: {}", span, truncate_chars(&message, ERROR_MESSAGE_CHARS)));
                    metrics::record_bulk_batch(kind.as_str(), 0, false);
                }
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            embedded = summary.embedded,
            skipped = summary.skipped,
            failed = summary.failed,
            elapsed_ms = summary.elapsed_ms,
            "Bulk embedding complete"
        );
        Ok(summary)
    }

    pub async fn embed_all_documents(&self) -> Result<BulkSummary, BulkEmbedError> {
        self.embed_kind(ContentKind::Documents).await
    }

    pub async fn embed_all_messages(&self) -> Result<BulkSummary, BulkEmbedError> {
        self.embed_kind(ContentKind::Messages).await
    }

    pub async fn embed_all_domains(&self) -> Result<BulkSummary, BulkEmbedError> {
        self.embed_kind(ContentKind::Domains).await
    }

    /// Run every kind in turn. A kind that fails structurally is logged and
    /// does not stop the others.
    pub async fn embed_all(&self) -> Vec<Result<BulkSummary, BulkEmbedError>> {
        let mut results = Vec::with_capacity(ContentKind::ALL.len());
        for kind in ContentKind::ALL {
            let result = self.embed_kind(kind).await;
            if let Err(e) = &result {
                warn!(kind = %kind, error = %e, "Bulk job aborted");
            }
            results.push(result);
        }
        results
    }

    /// Embed and upsert one row, replacing any existing point
    pub async fn upsert_row(&self, kind: ContentKind, row: ContentRow) -> Result<(), BulkEmbedError> {
        let collection = kind.collection();
        self.index.ensure_collection(collection).await?;
        let id = row.id.clone();
        self.embed_batch(collection, vec![row]).await?;
        debug!(collection = %collection, id = %id, "Row upserted");
        Ok(())
    }

    /// Re-read a row from the source and upsert it.
    ///
    /// Returns `false` when the row does not exist or is too short to index.
    pub async fn upsert_by_id(&self, kind: ContentKind, id: &str) -> Result<bool, BulkEmbedError> {
        let row = match self.source.fetch_row(kind, id).await? {
            Some(row) => row,
            None => return Ok(false),
        };
        if self.too_short(kind, &row.text) {
            return Ok(false);
        }
        self.upsert_row(kind, row).await?;
        Ok(true)
    }

    pub async fn upsert_document(&self, id: &str) -> Result<bool, BulkEmbedError> {
        self.upsert_by_id(ContentKind::Documents, id).await
    }

    pub async fn upsert_message(&self, id: &str) -> Result<bool, BulkEmbedError> {
        self.upsert_by_id(ContentKind::Messages, id).await
    }

    pub async fn upsert_domain(&self, name: &str) -> Result<bool, BulkEmbedError> {
        self.upsert_by_id(ContentKind::Domains, &domain_key(name)).await
    }

    /// Drop and recreate every configured collection
    pub async fn recreate(&self, collections: &[String]) -> Result<(), BulkEmbedError> {
        for name in collections {
            self.index.recreate_collection(name).await?;
            info!(collection = %name, "Collection recreated");
        }
        Ok(())
    }

    /// Embed a single passage
    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>, BulkEmbedError> {
        let mut vectors = self.embedder.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| BulkEmbedError::Embedding("no vector returned".to_string()))
    }
}
