//! Embedding service abstraction
//!
//! Provides a unified, asymmetric interface over embedding backends:
//! - Remote HTTP services (OpenAI-compatible `/embeddings` endpoints)
//! - In-process ONNX models (`local-models` feature)
//! - A deterministic keyword embedder for tests
//!
//! Documents and queries go through different encoding paths. Document
//! encoding is content-only; query encoding prepends the configured
//! instruction. Every input is cut to the character ceiling before it
//! reaches the model.

#[cfg(feature = "local-models")]
mod local;

#[cfg(feature = "local-models")]
pub use local::LocalEmbedder;

use crate::config::{EmbeddingConfig, ModelProvider};
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed passages for storage (document encoding path)
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query (query encoding path)
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// Cut `text` to its first `max_chars` characters.
///
/// Counts `char`s, not bytes, so the cut never splits a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Render the query-path input for instruction-tuned embedders
pub fn format_query(instruction: &str, query: &str) -> String {
    if instruction.trim().is_empty() {
        query.to_string()
    } else {
        format!("Instruct: {}\nQuery: {}", instruction.trim(), query)
    }
}

fn check_dimension(vectors: &[Vec<f32>], expected: usize) -> Result<()> {
    match vectors.iter().find(|v| v.len() != expected) {
        Some(bad) => Err(AppError::DimensionMismatch {
            expected,
            actual: bad.len(),
        }),
        None => Ok(()),
    }
}

/// HTTP embedding client for OpenAI-compatible endpoints.
///
/// Sends `input_type` (`passage` / `query`) alongside the inputs so
/// asymmetric backends can select their encoder.
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    base_url: String,
    max_chars: usize,
    query_instruction: String,
    max_retries: u32,
    timeout: Duration,
}

const PASSAGE_INPUT_TYPE: &str = "passage";
const QUERY_INPUT_TYPE: &str = "query";

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    input_type: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl HttpEmbedder {
    /// Create a new HTTP embedder from configuration
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config.api_base.clone().ok_or_else(|| AppError::Configuration {
            message: "embedding.api_base is required for the http provider".to_string(),
        })?;
        let timeout = Duration::from_secs(config.timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_chars: config.max_chars,
            query_instruction: config.query_instruction.clone(),
            max_retries: config.max_retries.max(1),
            timeout,
        })
    }

    /// Make request with retry on transient failures
    async fn request_with_retry(&self, inputs: &[String], input_type: &str) -> Result<Vec<Vec<f32>>> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Some(self.timeout * self.max_retries),
            ..Default::default()
        };
        let attempts = AtomicUsize::new(0);

        retry(policy, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match self.make_request(inputs, input_type).await {
                Ok(embeddings) => Ok(embeddings),
                Err(e) if is_transient(&e) && attempt < self.max_retries as usize => {
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Embedding request failed, retrying"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn make_request(&self, inputs: &[String], input_type: &str) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let request = EmbeddingRequest {
            input: inputs,
            model: &self.model,
            input_type,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::EmbeddingTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                AppError::EmbeddingError {
                    message: format!("Request failed: {}", e),
                }
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::EmbeddingError {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: EmbeddingResponse = response.json().await.map_err(|e| {
            AppError::EmbeddingError {
                message: format!("Failed to parse response: {}", e),
            }
        })?;

        if result.data.len() != inputs.len() {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "Backend returned {} embeddings for {} inputs",
                    result.data.len(),
                    inputs.len()
                ),
            });
        }

        let mut data = result.data;
        data.sort_by_key(|d| d.index.unwrap_or(0));
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        check_dimension(&vectors, self.dimension)?;
        Ok(vectors)
    }

    /// Document-path inputs: content only, cut to the ceiling
    fn passage_inputs(&self, texts: &[String]) -> Vec<String> {
        texts
            .iter()
            .map(|t| truncate_chars(t, self.max_chars).to_string())
            .collect()
    }

    /// Query-path input: cut to the ceiling, then instruction-formatted
    fn query_input(&self, text: &str) -> String {
        format_query(&self.query_instruction, truncate_chars(text, self.max_chars))
    }

    async fn timed(&self, inputs: Vec<String>, input_type: &str) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let result = self.request_with_retry(&inputs, input_type).await;
        metrics::record_embedding(
            start.elapsed().as_secs_f64(),
            &self.model,
            inputs.len(),
            result.is_ok(),
        );
        result
    }
}

fn is_transient(err: &AppError) -> bool {
    match err {
        AppError::EmbeddingTimeout { .. } => true,
        AppError::EmbeddingError { message } => {
            message.starts_with("Request failed")
                || message.starts_with("API error 429")
                || message.starts_with("API error 5")
        }
        _ => false,
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.timed(self.passage_inputs(texts), PASSAGE_INPUT_TYPE).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.timed(vec![self.query_input(text)], QUERY_INPUT_TYPE).await?;
        embeddings.into_iter().next().ok_or_else(|| AppError::EmbeddingError {
            message: "Empty response".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic keyword embedder for tests and offline development.
///
/// Each configured keyword owns one axis; every other token is hashed into
/// the remaining axes. Vectors are L2-normalised, so cosine similarity
/// reflects shared vocabulary and a test can predict ordering exactly.
pub struct MockEmbedder {
    dimension: usize,
    keywords: Vec<String>,
    max_chars: usize,
    instruction: String,
    fail: AtomicBool,
    document_inputs: Mutex<Vec<String>>,
    query_inputs: Mutex<Vec<String>>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self::with_keywords(dimension, &[])
    }

    /// Reserve one axis per keyword (in order) ahead of the hashed axes
    pub fn with_keywords(dimension: usize, keywords: &[&str]) -> Self {
        Self {
            dimension: dimension.max(keywords.len() + 1),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            max_chars: usize::MAX,
            instruction: String::new(),
            fail: AtomicBool::new(false),
            document_inputs: Mutex::new(Vec::new()),
            query_inputs: Mutex::new(Vec::new()),
        }
    }

    /// Apply a character ceiling like the real clients do
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    /// Format query-path inputs with an instruction like the real clients do
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Make every subsequent call fail as if the backend were down
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Texts received on the document path, after truncation
    pub fn document_inputs(&self) -> Vec<String> {
        self.document_inputs.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Texts received on the query path, after truncation and formatting
    pub fn query_inputs(&self) -> Vec<String> {
        self.query_inputs.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn axis(&self, token: &str) -> usize {
        if let Some(pos) = self.keywords.iter().position(|k| k == token) {
            return pos;
        }
        // FNV-1a keeps the mapping stable across runs
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let hashed_axes = self.dimension - self.keywords.len();
        self.keywords.len() + (hash % hashed_axes as u64) as usize
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.axis(token)] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn check_available(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::EmbeddingError {
                message: "mock embedder is offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.check_available()?;
        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t, self.max_chars).to_string())
            .collect();
        if let Ok(mut seen) = self.document_inputs.lock() {
            seen.extend(truncated.iter().cloned());
        }
        Ok(truncated.iter().map(|t| self.vectorize(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.check_available()?;
        let input = format_query(&self.instruction, truncate_chars(text, self.max_chars));
        if let Ok(mut seen) = self.query_inputs.lock() {
            seen.push(input.clone());
        }
        Ok(self.vectorize(&input))
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider {
        ModelProvider::Http => Ok(Arc::new(HttpEmbedder::new(config)?)),
        ModelProvider::Mock => Ok(Arc::new(
            MockEmbedder::new(config.dimension)
                .with_max_chars(config.max_chars)
                .with_instruction(config.query_instruction.clone()),
        )),
        #[cfg(feature = "local-models")]
        ModelProvider::Local => Ok(Arc::new(LocalEmbedder::new(config))),
        #[cfg(not(feature = "local-models"))]
        ModelProvider::Local => Err(AppError::Configuration {
            message: "embedding.provider = local requires the `local-models` feature".to_string(),
        }),
        ModelProvider::None => Err(AppError::Configuration {
            message: "an embedding provider is required".to_string(),
        }),
    }
}
