//! In-process cross-encoder backed by fastembed

use super::{normalize_score, Reranker};
use crate::config::{RerankerConfig, ScoreScale};
use crate::embeddings::truncate_chars;
use crate::errors::{AppError, Result};
use crate::loader::ModelLoader;
use crate::metrics;
use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::time::{Duration, Instant};

/// Cross-encoder running a local ONNX model, loaded lazily on first use
pub struct LocalReranker {
    model_name: String,
    max_chars: usize,
    score_scale: ScoreScale,
    loader: ModelLoader<TextRerank>,
}

fn resolve_model(name: &str) -> RerankerModel {
    match name.to_lowercase().as_str() {
        "jinaai/jina-reranker-v1-turbo-en" | "jina-reranker-v1-turbo-en" => {
            RerankerModel::JINARerankerV1TurboEn
        }
        "baai/bge-reranker-v2-m3" | "bge-reranker-v2-m3" => RerankerModel::BGERerankerV2M3,
        _ => RerankerModel::BGERerankerBase,
    }
}

impl LocalReranker {
    pub fn new(config: &RerankerConfig) -> Self {
        Self {
            model_name: config.model.clone(),
            max_chars: config.max_chars,
            score_scale: config.score_scale,
            loader: ModelLoader::new(
                config.model.clone(),
                Duration::from_secs(config.load_retry_cooldown_secs),
            ),
        }
    }

    /// Unload the model; it reloads on the next call
    pub async fn release(&self) {
        self.loader.release().await;
    }
}

#[async_trait]
impl Reranker for LocalReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let model_id = resolve_model(&self.model_name);
        let model = self
            .loader
            .get_or_load(move || TextRerank::try_new(RerankInitOptions::new(model_id)))
            .await?;

        let start = Instant::now();
        let count = documents.len();
        let query = query.to_string();
        let docs: Vec<String> = documents
            .iter()
            .map(|d| truncate_chars(d, self.max_chars).to_string())
            .collect();

        let outcome = tokio::task::spawn_blocking(move || model.rerank(query, docs, false, None))
            .await
            .map_err(|e| AppError::RerankError {
                message: format!("Rerank task panicked: {}", e),
            })?
            .map_err(|e| AppError::RerankError {
                message: e.to_string(),
            });
        metrics::record_rerank(start.elapsed().as_secs_f64(), &self.model_name, count, outcome.is_ok());

        let mut scores = vec![0.0; count];
        for result in outcome? {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = normalize_score(result.score, self.score_scale);
            }
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
