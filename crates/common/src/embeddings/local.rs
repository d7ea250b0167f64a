//! In-process ONNX embedder backed by fastembed

use super::{check_dimension, format_query, truncate_chars, Embedder};
use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::loader::ModelLoader;
use crate::metrics;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::time::{Duration, Instant};

/// Embedder running a local ONNX model, loaded lazily on first use
pub struct LocalEmbedder {
    model_name: String,
    dimension: usize,
    max_chars: usize,
    query_instruction: String,
    loader: ModelLoader<TextEmbedding>,
}

fn resolve_model(name: &str) -> EmbeddingModel {
    match name.to_lowercase().as_str() {
        "baai/bge-base-en-v1.5" | "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "baai/bge-large-en-v1.5" | "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "sentence-transformers/all-minilm-l6-v2" | "all-minilm-l6-v2" => {
            EmbeddingModel::AllMiniLML6V2
        }
        "nomic-ai/nomic-embed-text-v1.5" | "nomic-embed-text-v1.5" => {
            EmbeddingModel::NomicEmbedTextV15
        }
        "intfloat/multilingual-e5-large" | "multilingual-e5-large" => {
            EmbeddingModel::MultilingualE5Large
        }
        _ => EmbeddingModel::BGESmallENV15,
    }
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model_name: config.model.clone(),
            dimension: config.dimension,
            max_chars: config.max_chars,
            query_instruction: config.query_instruction.clone(),
            loader: ModelLoader::new(
                config.model.clone(),
                Duration::from_secs(config.load_retry_cooldown_secs),
            ),
        }
    }

    async fn encode(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model_id = resolve_model(&self.model_name);
        let model = self
            .loader
            .get_or_load(move || TextEmbedding::try_new(InitOptions::new(model_id)))
            .await?;

        let start = Instant::now();
        let batch = inputs.len();
        let outcome = tokio::task::spawn_blocking(move || model.embed(inputs, None))
            .await
            .map_err(|e| AppError::EmbeddingError {
                message: format!("Embedding task panicked: {}", e),
            })?
            .map_err(|e| AppError::EmbeddingError {
                message: e.to_string(),
            });
        metrics::record_embedding(
            start.elapsed().as_secs_f64(),
            &self.model_name,
            batch,
            outcome.is_ok(),
        );

        let vectors = outcome?;
        check_dimension(&vectors, self.dimension)?;
        Ok(vectors)
    }

    /// Document-path inputs are content only
    fn passage_inputs(&self, texts: &[String]) -> Vec<String> {
        texts
            .iter()
            .map(|t| truncate_chars(t, self.max_chars).to_string())
            .collect()
    }

    fn query_input(&self, text: &str) -> String {
        format_query(&self.query_instruction, truncate_chars(text, self.max_chars))
    }

    /// Unload the model; it reloads on the next call
    pub async fn release(&self) {
        self.loader.release().await;
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.encode(self.passage_inputs(texts)).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.encode(vec![self.query_input(text)]).await?;
        vectors.into_iter().next().ok_or_else(|| AppError::EmbeddingError {
            message: "Empty response".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
