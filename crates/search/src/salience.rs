//! Salience feedback
//!
//! Salience is a slowly accumulating trust score stored on every point,
//! independent of query similarity. Two signals move it:
//!
//! - rerank: every reranked candidate is nudged up by `rerank_score * boost_rate`
//! - usage: hits the consumer drew on are boosted, ignored hits decay, and
//!   ambiguous scores in between leave salience alone
//!
//! Both writers are best-effort. They report what happened but never fail
//! the caller; a backend error only costs the update.

use crate::usage::UsageScoredHit;
use atlas_common::config::SalienceConfig;
use atlas_common::metrics;
use atlas_common::vector::{payload_fields, Candidate, Payload, VectorIndex};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Rerank-driven update: `min(1, current + rerank_score * boost_rate)`.
///
/// With a configured decay threshold, scores below it subtract
/// `rerank_decay_rate` instead. The result always lies in `[0, 1]`.
pub fn rerank_update(current: f64, rerank_score: f64, config: &SalienceConfig) -> f64 {
    let current = current.clamp(0.0, 1.0);
    if let Some(threshold) = config.rerank_decay_threshold {
        if rerank_score < threshold {
            return (current - config.rerank_decay_rate).clamp(0.0, 1.0);
        }
    }
    (current + rerank_score.max(0.0) * config.boost_rate).clamp(0.0, 1.0)
}

/// Usage-driven update, bounded to `[0, 1]`; `None` inside the neutral band
pub fn usage_update(current: f64, usage_score: f64, config: &SalienceConfig) -> Option<f64> {
    let current = current.clamp(0.0, 1.0);
    if usage_score > config.usage_boost_threshold {
        Some((current + usage_score * config.usage_rate).clamp(0.0, 1.0))
    } else if usage_score < config.usage_decay_threshold {
        Some((current - config.decay_rate).clamp(0.0, 1.0))
    } else {
        None
    }
}

/// Outcome counts of one write-back pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SalienceReport {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Writes salience changes back into point payloads
pub struct SalienceEngine {
    index: Arc<dyn VectorIndex>,
}

impl SalienceEngine {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }

    /// Current salience of a point; the default when never written
    async fn current(&self, collection: &str, id: &str, default: f64) -> atlas_common::Result<f64> {
        let payload = self.index.get_payload(collection, id).await?;
        Ok(payload
            .as_ref()
            .and_then(|p| p.get(payload_fields::SALIENCE))
            .and_then(Value::as_f64)
            .unwrap_or(default))
    }

    async fn write(&self, collection: &str, id: &str, salience: f64, stamp_field: &str) -> atlas_common::Result<()> {
        let mut partial = Payload::new();
        partial.insert(payload_fields::SALIENCE.to_string(), json!(salience));
        partial.insert(stamp_field.to_string(), json!(Utc::now().to_rfc3339()));
        self.index.set_payload(collection, id, partial).await
    }

    /// Apply the rerank signal of every reranked candidate
    #[instrument(skip(self, results, config), fields(count = results.len()))]
    pub async fn write_rerank_salience(
        &self,
        collection: &str,
        results: &[Candidate],
        config: &SalienceConfig,
    ) -> SalienceReport {
        let mut report = SalienceReport::default();
        let mut backend_down = false;

        for result in results {
            let Some(rerank_score) = result.rerank_score else {
                report.skipped += 1;
                continue;
            };
            if result.id.is_empty() {
                report.skipped += 1;
                continue;
            }

            let outcome = async {
                let current = self.current(collection, &result.id, config.default).await?;
                let next = rerank_update(current, f64::from(rerank_score), config);
                self.write(collection, &result.id, next, payload_fields::LAST_RETRIEVED)
                    .await
            }
            .await;

            match outcome {
                Ok(()) => {
                    report.updated += 1;
                    backend_down = false;
                }
                Err(e) => {
                    let unavailable = e.is_backend_unavailable();
                    // Unreachable at the start or twice in a row: the rest would fail too
                    if unavailable && (backend_down || report.updated == 0) {
                        warn!(collection, error = %e, "Salience write-back stopped, vector store unavailable");
                        report.failed = results.len() - report.updated - report.skipped;
                        break;
                    }
                    debug!(collection, id = %result.id, error = %e, "Salience write-back failed");
                    report.failed += 1;
                    backend_down = unavailable;
                }
            }
        }

        metrics::record_salience_writes("rerank", report.updated, report.skipped, report.failed);
        report
    }

    /// Apply the usage signal of every scored hit
    #[instrument(skip(self, hits, config), fields(count = hits.len()))]
    pub async fn write_usage_salience(
        &self,
        collection: &str,
        hits: &[UsageScoredHit],
        config: &SalienceConfig,
    ) -> SalienceReport {
        let mut report = SalienceReport::default();
        let mut backend_down = false;

        for scored in hits {
            let id = &scored.hit.id;
            if id.is_empty() {
                report.skipped += 1;
                continue;
            }

            let outcome = async {
                let current = self.current(collection, id, config.default).await?;
                match usage_update(current, scored.usage_score, config) {
                    Some(next) => self
                        .write(collection, id, next, payload_fields::LAST_USAGE_SIGNAL)
                        .await
                        .map(|_| true),
                    None => Ok(false),
                }
            }
            .await;

            match outcome {
                Ok(written) => {
                    if written {
                        report.updated += 1;
                    } else {
                        report.skipped += 1;
                    }
                    backend_down = false;
                }
                Err(e) => {
                    let unavailable = e.is_backend_unavailable();
                    if unavailable && (backend_down || report.updated == 0) {
                        warn!(collection, error = %e, "Usage salience stopped, vector store unavailable");
                        report.failed = hits.len() - report.updated - report.skipped;
                        break;
                    }
                    debug!(collection, id = %id, error = %e, "Usage salience failed");
                    report.failed += 1;
                    backend_down = unavailable;
                }
            }
        }

        metrics::record_salience_writes("usage", report.updated, report.skipped, report.failed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atlas_common::vector::{InMemoryVectorIndex, VectorPoint};
    use atlas_common::AppError;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Index whose payload reads start failing after `healthy` calls
    struct DroppingIndex {
        inner: InMemoryVectorIndex,
        healthy: usize,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for DroppingIndex {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn ensure_collection(&self, name: &str) -> atlas_common::Result<()> {
            self.inner.ensure_collection(name).await
        }

        async fn recreate_collection(&self, name: &str) -> atlas_common::Result<()> {
            self.inner.recreate_collection(name).await
        }

        async fn upsert_batch(&self, collection: &str, points: Vec<VectorPoint>) -> atlas_common::Result<()> {
            self.inner.upsert_batch(collection, points).await
        }

        async fn point_exists(&self, collection: &str, id: &str) -> atlas_common::Result<bool> {
            self.inner.point_exists(collection, id).await
        }

        async fn search(&self, collection: &str, vector: &[f32], limit: usize) -> atlas_common::Result<Vec<Candidate>> {
            self.inner.search(collection, vector, limit).await
        }

        async fn get_payload(&self, collection: &str, id: &str) -> atlas_common::Result<Option<Payload>> {
            if self.reads.fetch_add(1, Ordering::SeqCst) >= self.healthy {
                return Err(AppError::VectorStore {
                    message: "connection refused".to_string(),
                });
            }
            self.inner.get_payload(collection, id).await
        }

        async fn set_payload(&self, collection: &str, id: &str, partial: Payload) -> atlas_common::Result<()> {
            self.inner.set_payload(collection, id, partial).await
        }
    }

    fn config() -> SalienceConfig {
        SalienceConfig::default()
    }

    async fn index_with(ids: &[&str]) -> Arc<InMemoryVectorIndex> {
        let index = Arc::new(InMemoryVectorIndex::new(2));
        index.ensure_collection("docs").await.unwrap();
        for id in ids {
            index
                .upsert("docs", VectorPoint::new(*id, vec![1.0, 0.0]))
                .await
                .unwrap();
        }
        index
    }

    fn reranked(id: &str, score: f32) -> Candidate {
        let mut candidate = Candidate::new(id, 0.5, Payload::new());
        candidate.rerank_score = Some(score);
        candidate
    }

    fn used(id: &str, usage_score: f64) -> UsageScoredHit {
        UsageScoredHit {
            hit: Candidate::new(id, 0.5, Payload::new()),
            usage_score,
        }
    }

    async fn salience_of(index: &InMemoryVectorIndex, id: &str) -> Option<f64> {
        index
            .get_payload("docs", id)
            .await
            .unwrap()
            .and_then(|p| p.get("salience").and_then(Value::as_f64))
    }

    #[tokio::test]
    async fn test_first_rerank_boost_from_default() {
        let index = index_with(&["p1"]).await;
        let engine = SalienceEngine::new(index.clone());

        let report = engine
            .write_rerank_salience("docs", &[reranked("p1", 1.0)], &config())
            .await;

        assert_eq!(report.updated, 1);
        let salience = salience_of(&index, "p1").await.unwrap();
        assert!((salience - 0.55).abs() < 1e-9);

        let payload = index.get_payload("docs", "p1").await.unwrap().unwrap();
        assert!(payload.contains_key("last_retrieved"));
        assert!(!payload.contains_key("last_usage_signal"));
    }

    #[tokio::test]
    async fn test_rerank_boost_strictly_increases_until_ceiling() {
        let cfg = config();
        let mut salience = 0.5;
        for _ in 0..40 {
            let next = rerank_update(salience, 0.8, &cfg);
            if salience < 1.0 {
                assert!(next > salience);
            } else {
                assert_eq!(next, 1.0);
            }
            salience = next;
        }
        assert_eq!(salience, 1.0);
        assert_eq!(rerank_update(1.0, 1.0, &cfg), 1.0);
    }

    #[test]
    fn test_rerank_never_decays_by_default() {
        assert_eq!(rerank_update(0.6, 0.0, &config()), 0.6);
    }

    #[test]
    fn test_optional_rerank_decay() {
        let cfg = SalienceConfig {
            rerank_decay_threshold: Some(0.2),
            rerank_decay_rate: 0.01,
            ..config()
        };
        assert!((rerank_update(0.5, 0.1, &cfg) - 0.49).abs() < 1e-9);
        assert_eq!(rerank_update(0.005, 0.1, &cfg), 0.0);
        assert!(rerank_update(0.5, 0.9, &cfg) > 0.5);
    }

    #[test]
    fn test_usage_update_bands() {
        let cfg = config();
        assert!((usage_update(0.5, 1.0, &cfg).unwrap() - 0.55).abs() < 1e-9);
        assert!((usage_update(0.5, 0.0, &cfg).unwrap() - 0.48).abs() < 1e-9);
        assert_eq!(usage_update(0.01, 0.05, &cfg), Some(0.0));
        assert_eq!(usage_update(0.5, 0.2, &cfg), None);
        // Band edges are neutral too
        assert_eq!(usage_update(0.5, 0.3, &cfg), None);
        assert_eq!(usage_update(0.5, 0.1, &cfg), None);
    }

    #[test]
    fn test_salience_stays_bounded() {
        let cfg = config();
        let mut rng = rand::thread_rng();
        let mut salience: f64 = 0.5;

        for _ in 0..10_000 {
            let signal: f64 = rng.gen_range(0.0..=1.0);
            salience = if rng.gen_bool(0.5) {
                rerank_update(salience, signal, &cfg)
            } else {
                usage_update(salience, signal, &cfg).unwrap_or(salience)
            };
            assert!((0.0..=1.0).contains(&salience), "salience escaped: {}", salience);
        }
    }

    #[test]
    fn test_negative_rates_cannot_escape_bounds() {
        let cfg = SalienceConfig {
            boost_rate: -2.0,
            usage_rate: -2.0,
            decay_rate: -2.0,
            ..config()
        };
        assert_eq!(rerank_update(0.5, 1.0, &cfg), 0.0);
        assert_eq!(usage_update(0.5, 0.9, &cfg), Some(0.0));
        assert_eq!(usage_update(0.5, 0.0, &cfg), Some(1.0));
    }

    #[tokio::test]
    async fn test_store_dropping_mid_batch_stops_the_pass() {
        let inner = InMemoryVectorIndex::new(2);
        inner.ensure_collection("docs").await.unwrap();
        let ids = ["p1", "p2", "p3", "p4", "p5"];
        for id in ids {
            inner.upsert("docs", VectorPoint::new(id, vec![1.0, 0.0])).await.unwrap();
        }
        let index = Arc::new(DroppingIndex {
            inner,
            healthy: 2,
            reads: AtomicUsize::new(0),
        });
        let engine = SalienceEngine::new(index.clone());

        let results: Vec<Candidate> = ids.iter().map(|id| reranked(id, 0.9)).collect();
        let report = engine.write_rerank_salience("docs", &results, &config()).await;

        assert_eq!(report, SalienceReport { updated: 2, skipped: 0, failed: 3 });
        // p3 and p4 fail; p5 is never attempted
        assert_eq!(index.reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_usage_dead_zone_leaves_point_untouched() {
        let index = index_with(&["p1"]).await;
        let engine = SalienceEngine::new(index.clone());
        let before = index.get_payload("docs", "p1").await.unwrap();

        let report = engine
            .write_usage_salience("docs", &[used("p1", 0.2)], &config())
            .await;

        assert_eq!(report, SalienceReport { updated: 0, skipped: 1, failed: 0 });
        assert_eq!(index.get_payload("docs", "p1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_usage_boost_and_decay_written() {
        let index = index_with(&["hot", "cold"]).await;
        let engine = SalienceEngine::new(index.clone());

        let report = engine
            .write_usage_salience("docs", &[used("hot", 0.9), used("cold", 0.0)], &config())
            .await;

        assert_eq!(report.updated, 2);
        assert!((salience_of(&index, "hot").await.unwrap() - 0.545).abs() < 1e-9);
        assert!((salience_of(&index, "cold").await.unwrap() - 0.48).abs() < 1e-9);
        let payload = index.get_payload("docs", "hot").await.unwrap().unwrap();
        assert!(payload.contains_key("last_usage_signal"));
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let index = index_with(&["p1"]).await;
        let engine = SalienceEngine::new(index.clone());

        // Unknown point and unknown collection: counted, never raised
        let report = engine
            .write_rerank_salience(
                "docs",
                &[reranked("ghost", 0.9), reranked("p1", 0.5), Candidate::new("", 0.1, Payload::new())],
                &config(),
            )
            .await;
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);

        let report = engine
            .write_usage_salience("missing", &[used("p1", 0.9)], &config())
            .await;
        assert_eq!(report.failed, 1);
    }
}
