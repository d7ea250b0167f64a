//! Cross-encoder reranking
//!
//! Second retrieval stage: every (query, passage) pair is scored jointly and
//! the candidates are reordered by that score. Scores handed back to callers
//! are always in [0, 1]; backends that emit raw logits are passed through a
//! sigmoid.

#[cfg(feature = "local-models")]
mod local;

#[cfg(feature = "local-models")]
pub use local::LocalReranker;

use crate::config::{ModelProvider, RerankerConfig, ScoreScale};
use crate::embeddings::truncate_chars;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::vector::Candidate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Logistic function mapping a raw logit onto (0, 1)
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Bring a backend score onto [0, 1]
pub fn normalize_score(raw: f32, scale: ScoreScale) -> f32 {
    match scale {
        ScoreScale::Logit => sigmoid(raw),
        ScoreScale::Probability => raw.clamp(0.0, 1.0),
    }
}

/// Order by rerank score, falling back to ANN score on ties
fn by_relevance(a: &Candidate, b: &Candidate) -> Ordering {
    let ra = a.rerank_score.unwrap_or(0.0);
    let rb = b.rerank_score.unwrap_or(0.0);
    rb.partial_cmp(&ra)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
}

/// Trait for cross-encoder rerankers
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each document against the query, in input order, on [0, 1]
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Attach a rerank score to every candidate and sort descending.
    ///
    /// Returns every input candidate; truncation is the caller's job.
    async fn rerank(&self, query: &str, candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let documents: Vec<String> = candidates.iter().map(|c| c.text().to_string()).collect();
        let scores = self.score(query, &documents).await?;
        if scores.len() != candidates.len() {
            return Err(AppError::RerankError {
                message: format!(
                    "Reranker returned {} scores for {} candidates",
                    scores.len(),
                    candidates.len()
                ),
            });
        }

        let mut reranked: Vec<Candidate> = candidates
            .into_iter()
            .zip(scores)
            .map(|(mut candidate, score)| {
                candidate.rerank_score = Some(score);
                candidate
            })
            .collect();
        reranked.sort_by(by_relevance);
        Ok(reranked)
    }
}

/// HTTP client for `/rerank` endpoints (Cohere, Jina, TEI and compatible)
pub struct HttpReranker {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    score_scale: ScoreScale,
    max_chars: usize,
    timeout: Duration,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
}

#[derive(Deserialize)]
struct RerankResponse {
    #[serde(alias = "rankings", alias = "data")]
    results: Vec<RerankEntry>,
}

#[derive(Deserialize)]
struct RerankEntry {
    index: usize,
    #[serde(alias = "relevance_score", alias = "logit")]
    score: f32,
}

impl HttpReranker {
    /// Create a new HTTP reranker from configuration
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let base_url = config.api_base.clone().ok_or_else(|| AppError::Configuration {
            message: "reranker.api_base is required for the http provider".to_string(),
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
            base_url: base_url.trim_end_matches('/').to_string(),
            score_scale: config.score_scale,
            max_chars: config.max_chars,
            timeout,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let request = RerankRequest {
            model: &self.model,
            query,
            documents: documents
                .iter()
                .map(|d| truncate_chars(d, self.max_chars))
                .collect(),
        };

        let mut builder = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let outcome = async {
            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    AppError::RerankTimeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    AppError::RerankError {
                        message: format!("Request failed: {}", e),
                    }
                }
            })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::RerankError {
                    message: format!("API error {}: {}", status, body),
                });
            }

            let parsed: RerankResponse = response.json().await.map_err(|e| AppError::RerankError {
                message: format!("Failed to parse response: {}", e),
            })?;
            scores_in_input_order(parsed.results, documents.len(), self.score_scale)
        }
        .await;

        metrics::record_rerank(
            start.elapsed().as_secs_f64(),
            &self.model,
            documents.len(),
            outcome.is_ok(),
        );
        outcome
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Rebuild the score vector in input order from index-tagged entries
fn scores_in_input_order(entries: Vec<RerankEntry>, expected: usize, scale: ScoreScale) -> Result<Vec<f32>> {
    let mut scores = vec![None; expected];
    for entry in entries {
        let slot = scores.get_mut(entry.index).ok_or_else(|| AppError::RerankError {
            message: format!("Result index {} out of range for {} documents", entry.index, expected),
        })?;
        *slot = Some(normalize_score(entry.score, scale));
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            s.ok_or_else(|| AppError::RerankError {
                message: format!("No score returned for document {}", i),
            })
        })
        .collect()
}

/// Deterministic lexical reranker for tests.
///
/// Scores by the fraction of query tokens present in the document, so
/// passages that repeat the query's words outrank ones that do not.
pub struct MockReranker {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockReranker {
    pub fn new() -> Self {
        Self {
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Number of score calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

impl Default for MockReranker {
    fn default() -> Self {
        Self::new()
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl Reranker for MockReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(AppError::RerankError {
                message: "mock reranker failure".to_string(),
            });
        }

        let query_tokens = tokens(query);
        if query_tokens.is_empty() {
            return Ok(vec![0.0; documents.len()]);
        }

        Ok(documents
            .iter()
            .map(|doc| {
                let doc_tokens = tokens(doc);
                let hits = query_tokens.intersection(&doc_tokens).count();
                hits as f32 / query_tokens.len() as f32
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "mock-reranker"
    }
}

/// Create a reranker based on configuration; `None` disables reranking
pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    match config.provider {
        ModelProvider::None => Ok(None),
        ModelProvider::Mock => Ok(Some(Arc::new(MockReranker::new()))),
        ModelProvider::Http => Ok(Some(Arc::new(HttpReranker::new(config)?))),
        #[cfg(feature = "local-models")]
        ModelProvider::Local => Ok(Some(Arc::new(LocalReranker::new(config)))),
        #[cfg(not(feature = "local-models"))]
        ModelProvider::Local => Err(AppError::Configuration {
            message: "reranker.provider = local requires the local-models feature".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Payload;
    use serde_json::json;

    fn candidate(id: &str, score: f32, text: &str) -> Candidate {
        let mut payload = Payload::new();
        payload.insert("text".into(), json!(text));
        Candidate::new(id, score, payload)
    }

    #[test]
    fn test_sigmoid_normalization() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(8.0) > 0.99);
        assert!(sigmoid(-8.0) < 0.01);
        assert_eq!(normalize_score(1.7, ScoreScale::Probability), 1.0);
        assert_eq!(normalize_score(0.4, ScoreScale::Probability), 0.4);
    }

    #[test]
    fn test_scores_in_input_order() {
        let entries = vec![
            RerankEntry { index: 1, score: 0.9 },
            RerankEntry { index: 0, score: 0.2 },
        ];
        let scores = scores_in_input_order(entries, 2, ScoreScale::Probability).unwrap();
        assert_eq!(scores, vec![0.2, 0.9]);

        let missing = scores_in_input_order(
            vec![RerankEntry { index: 0, score: 0.1 }],
            2,
            ScoreScale::Probability,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn test_response_aliases() {
        let cohere: RerankResponse = serde_json::from_value(json!({
            "results": [{ "index": 0, "relevance_score": 0.7 }]
        }))
        .unwrap();
        assert_eq!(cohere.results[0].score, 0.7);

        let tei: RerankResponse = serde_json::from_value(json!({
            "rankings": [{ "index": 0, "logit": -1.5 }]
        }))
        .unwrap();
        assert_eq!(tei.results[0].score, -1.5);
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_keeps_all() {
        let reranker = MockReranker::new();
        let candidates = vec![
            candidate("a", 0.9, "weather report for tuesday"),
            candidate("b", 0.5, "apple pie recipe with cinnamon"),
            candidate("c", 0.7, "apple orchard"),
        ];

        let reranked = reranker.rerank("apple pie recipe", candidates).await.unwrap();
        let ids: Vec<_> = reranked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(reranked.iter().all(|c| c.rerank_score.is_some()));
        // ANN scores are left untouched
        assert_eq!(reranked[0].score, 0.5);
    }

    #[tokio::test]
    async fn test_rerank_ties_fall_back_to_ann_score() {
        let reranker = MockReranker::new();
        let candidates = vec![
            candidate("low", 0.3, "nothing relevant"),
            candidate("high", 0.8, "still nothing"),
        ];
        let reranked = reranker.rerank("apple", candidates).await.unwrap();
        assert_eq!(reranked[0].id, "high");
    }

    #[tokio::test]
    async fn test_rerank_empty_input() {
        let reranker = MockReranker::new();
        let reranked = reranker.rerank("anything", Vec::new()).await.unwrap();
        assert!(reranked.is_empty());
        assert_eq!(reranker.calls(), 0);
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let reranker = MockReranker::new();
        reranker.set_failing(true);
        let err = reranker
            .rerank("apple", vec![candidate("a", 0.5, "apple")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RerankError { .. }));
    }

    #[test]
    fn test_create_reranker_none() {
        let config = RerankerConfig {
            provider: ModelProvider::None,
            ..Default::default()
        };
        assert!(create_reranker(&config).unwrap().is_none());
    }
}
