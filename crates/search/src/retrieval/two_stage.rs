//! Search orchestrator: embed, ANN search, rerank, write back

use super::{merge_by_relevance, SearchMode};
use crate::background::BackgroundTasks;
use crate::context::{self, RagContext};
use crate::salience::SalienceEngine;
use crate::usage::{compute_usage, UsageScoredHit};
use atlas_common::errors::Result;
use atlas_common::metrics;
use atlas_common::vector::Candidate;
use atlas_common::{AppConfig, Embedder, Reranker, RetrievalTuning, SettingsProvider, VectorIndex};
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Two-stage search over the vector index with salience feedback.
///
/// All collaborators are injected; the service owns only its background
/// write-back tasks.
pub struct SearchService {
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    index: Arc<dyn VectorIndex>,
    settings: Arc<dyn SettingsProvider>,
    config: Arc<AppConfig>,
    salience: Arc<SalienceEngine>,
    background: BackgroundTasks,
}

impl SearchService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        index: Arc<dyn VectorIndex>,
        settings: Arc<dyn SettingsProvider>,
        config: Arc<AppConfig>,
    ) -> Self {
        info!(
            embedder = embedder.model_name(),
            reranker = reranker.as_ref().map(|r| r.model_name()).unwrap_or("none"),
            collections = ?config.vector.collections,
            "Search service ready"
        );
        Self {
            salience: Arc::new(SalienceEngine::new(index.clone())),
            embedder,
            reranker,
            index,
            settings,
            config,
            background: BackgroundTasks::new(),
        }
    }

    /// Collections searched by [`search_all`](Self::search_all)
    pub fn collections(&self) -> &[String] {
        &self.config.vector.collections
    }

    pub fn salience(&self) -> &SalienceEngine {
        &self.salience
    }

    /// Parameters in effect for the next call
    pub async fn tuning(&self) -> RetrievalTuning {
        RetrievalTuning::resolve(self.settings.as_ref(), &self.config).await
    }

    /// Create every configured collection that does not exist yet
    pub async fn ensure_collections(&self) -> Result<()> {
        for collection in self.collections() {
            self.index.ensure_collection(collection).await?;
        }
        Ok(())
    }

    /// Ranked candidates from one collection.
    ///
    /// With `rerank`, a wider ANN net is reordered by the cross-encoder and
    /// the reranked list feeds salience write-back in the background. A
    /// reranker failure falls back to ANN order. Embedding and index
    /// failures propagate.
    #[instrument(skip(self, query))]
    pub async fn search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        rerank: bool,
    ) -> Result<Vec<Candidate>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let tuning = self.tuning().await;
        let vector = self.embedder.embed_query(query).await?;
        self.search_embedded(query, &vector, collection, limit, rerank, &tuning)
            .await
    }

    /// Ranked candidates across every configured collection, each tagged
    /// with its `source_collection`; never more than `limit` in total.
    #[instrument(skip(self, query))]
    pub async fn search_all(&self, query: &str, limit: usize, rerank: bool) -> Result<Vec<Candidate>> {
        let tuning = self.tuning().await;
        self.search_all_with(query, limit, rerank, &tuning).await
    }

    async fn search_all_with(
        &self,
        query: &str,
        limit: usize,
        rerank: bool,
        tuning: &RetrievalTuning,
    ) -> Result<Vec<Candidate>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_query(query).await?;

        let lists = try_join_all(self.collections().iter().map(|collection| {
            self.search_embedded(query, &vector, collection, limit, rerank, tuning)
        }))
        .await?;

        let reranked = rerank && self.reranker.is_some();
        Ok(merge_by_relevance(lists, reranked, limit))
    }

    async fn search_embedded(
        &self,
        query: &str,
        vector: &[f32],
        collection: &str,
        limit: usize,
        rerank: bool,
        tuning: &RetrievalTuning,
    ) -> Result<Vec<Candidate>> {
        let start = Instant::now();
        let reranker = if rerank { self.reranker.as_ref() } else { None };
        // Reranking always sees exactly the configured candidate width
        let ann_limit = match reranker {
            Some(_) => tuning.retrieval.rerank_candidates,
            None => limit,
        };

        let mut candidates = self.index.search(collection, vector, ann_limit).await?;
        for candidate in &mut candidates {
            candidate.source_collection = Some(collection.to_string());
        }

        let (mut results, mode) = match reranker {
            Some(reranker) if !candidates.is_empty() => {
                match reranker.rerank(query, candidates.clone()).await {
                    Ok(reranked) => {
                        self.schedule_rerank_salience(collection, &reranked, tuning);
                        (reranked, SearchMode::Rerank)
                    }
                    Err(e) => {
                        warn!(collection, error = %e, "Reranker unavailable, returning ANN results");
                        metrics::record_rerank_fallback(collection);
                        (candidates, SearchMode::AnnFallback)
                    }
                }
            }
            _ => (candidates, SearchMode::Ann),
        };
        results.truncate(limit);

        metrics::record_search(start.elapsed().as_secs_f64(), mode.as_str(), results.len());
        debug!(
            collection,
            mode = mode.as_str(),
            ann_limit,
            returned = results.len(),
            "Search complete"
        );
        Ok(results)
    }

    fn schedule_rerank_salience(&self, collection: &str, reranked: &[Candidate], tuning: &RetrievalTuning) {
        let engine = self.salience.clone();
        let collection = collection.to_string();
        let results = reranked.to_vec();
        let config = tuning.salience.clone();
        self.background.spawn("rerank_salience", async move {
            engine.write_rerank_salience(&collection, &results, &config).await;
        });
    }

    /// Prompt context for a chat turn.
    ///
    /// Degrades to an empty context on any failure.
    #[instrument(skip(self, query))]
    pub async fn build_rag_context(&self, query: &str) -> RagContext {
        let tuning = self.tuning().await;
        let retrieval = &tuning.retrieval;

        match self
            .search_all_with(query, retrieval.max_context_chunks, true, &tuning)
            .await
        {
            Ok(hits) => context::assemble(hits, retrieval.score_threshold, retrieval.context_chars_per_chunk),
            Err(e) => {
                warn!(error = %e, "RAG context unavailable");
                RagContext::default()
            }
        }
    }

    /// Score how much `response` drew on each hit and feed the result back
    /// into salience in the background.
    ///
    /// Hits are written to their `source_collection`; untagged hits are
    /// scored but not written.
    pub async fn record_usage(&self, hits: &[Candidate], response: &str) -> Vec<UsageScoredHit> {
        let scored = compute_usage(hits, response, &self.config.usage);
        if scored.is_empty() {
            return scored;
        }

        let mut by_collection: HashMap<String, Vec<UsageScoredHit>> = HashMap::new();
        for hit in &scored {
            match &hit.hit.source_collection {
                Some(collection) => by_collection
                    .entry(collection.clone())
                    .or_default()
                    .push(hit.clone()),
                None => debug!(id = %hit.hit.id, "Usage hit has no collection, not written"),
            }
        }

        let config = self.tuning().await.salience;
        for (collection, hits) in by_collection {
            let engine = self.salience.clone();
            let config = config.clone();
            self.background.spawn("usage_salience", async move {
                engine.write_usage_salience(&collection, &hits, &config).await;
            });
        }
        scored
    }

    /// Wait for all scheduled salience writes
    pub async fn flush_background(&self) {
        self.background.flush().await;
    }

    /// Drain salience writes, giving up after `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        let aborted = self.background.shutdown(timeout).await;
        if aborted > 0 {
            warn!(aborted, "Salience writes abandoned at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_common::embeddings::MockEmbedder;
    use atlas_common::reranking::MockReranker;
    use atlas_common::settings::{keys, StaticSettings};
    use atlas_common::vector::{InMemoryVectorIndex, VectorPoint};
    use atlas_common::AppError;
    use serde_json::{json, Value};

    const KEYWORDS: &[&str] = &[
        "apple", "pie", "recipe", "car", "engine", "repair", "varieties", "guide", "orchard",
    ];

    struct Fixture {
        service: SearchService,
        embedder: Arc<MockEmbedder>,
        reranker: Arc<MockReranker>,
        index: Arc<InMemoryVectorIndex>,
        settings: Arc<StaticSettings>,
    }

    async fn seed(index: &InMemoryVectorIndex, embedder: &MockEmbedder, collection: &str, rows: &[(&str, &str)]) {
        index.ensure_collection(collection).await.unwrap();
        let texts: Vec<String> = rows.iter().map(|(_, t)| t.to_string()).collect();
        let vectors = embedder.embed_documents(&texts).await.unwrap();
        let points = rows
            .iter()
            .zip(vectors)
            .map(|((id, text), vector)| VectorPoint::new(*id, vector).with_payload("text", json!(text)))
            .collect();
        index.upsert_batch(collection, points).await.unwrap();
    }

    async fn fixture() -> Fixture {
        let embedder = Arc::new(MockEmbedder::with_keywords(32, KEYWORDS));
        let reranker = Arc::new(MockReranker::new());
        let index = Arc::new(InMemoryVectorIndex::new(embedder.dimension()));
        let settings = Arc::new(StaticSettings::new());

        seed(
            &index,
            &embedder,
            "documents",
            &[
                ("p1", "apple pie recipe"),
                ("p2", "car engine repair"),
                ("p3", "apple varieties guide"),
            ],
        )
        .await;
        seed(
            &index,
            &embedder,
            "messages",
            &[
                ("m1", "Q: which apple for pie\nA: tart ones"),
                ("m2", "Q: engine noise\nA: check the belt"),
                ("m3", "Q: orchard visit\nA: apple picking in autumn"),
            ],
        )
        .await;

        let service = SearchService::new(
            embedder.clone(),
            Some(reranker.clone() as Arc<dyn Reranker>),
            index.clone(),
            settings.clone(),
            Arc::new(AppConfig::default()),
        );
        Fixture {
            service,
            embedder,
            reranker,
            index,
            settings,
        }
    }

    async fn salience_of(index: &InMemoryVectorIndex, collection: &str, id: &str) -> Option<f64> {
        index
            .get_payload(collection, id)
            .await
            .unwrap()
            .and_then(|p| p.get("salience").and_then(Value::as_f64))
    }

    #[tokio::test]
    async fn test_ann_search_ranks_topical_points_first() {
        let f = fixture().await;

        let top = f.service.search("apple", "documents", 2, false).await.unwrap();
        let ids: Vec<_> = top.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"p1") && ids.contains(&"p3"));

        let all = f.service.search("apple", "documents", 3, false).await.unwrap();
        let car = all.iter().find(|c| c.id == "p2").unwrap();
        assert!(top.iter().all(|c| c.score > car.score));
    }

    #[tokio::test]
    async fn test_ann_search_is_ordered_and_skips_salience() {
        let f = fixture().await;
        let results = f.service.search("apple orchard guide", "messages", 3, false).await.unwrap();

        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(results.iter().all(|c| c.rerank_score.is_none()));
        assert_eq!(f.reranker.calls(), 0);

        f.service.flush_background().await;
        assert!(salience_of(&f.index, "messages", &results[0].id).await.is_none());
    }

    #[tokio::test]
    async fn test_reranked_search_orders_and_writes_salience() {
        let f = fixture().await;

        let wide = f.service.search("apple pie", "documents", 20, false).await.unwrap();
        let results = f.service.search("apple pie", "documents", 2, true).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "p1");
        assert!(results
            .windows(2)
            .all(|w| w[0].rerank_score >= w[1].rerank_score));
        assert!(results.iter().all(|c| wide.iter().any(|w| w.id == c.id)));

        f.service.flush_background().await;
        let salience = salience_of(&f.index, "documents", "p1").await.unwrap();
        assert!((salience - 0.55).abs() < 1e-9);
        // The whole reranked list is written back, not just the returned slice
        assert!(salience_of(&f.index, "documents", "p2").await.is_some());
    }

    #[tokio::test]
    async fn test_reranked_results_come_from_candidate_window() {
        let f = fixture().await;
        f.settings.set(keys::RERANK_CANDIDATES, "2").await;

        let window = f.service.search("apple pie", "documents", 2, false).await.unwrap();
        let results = f.service.search("apple pie", "documents", 4, true).await.unwrap();

        assert!(results.len() <= 2);
        assert!(results.iter().all(|c| window.iter().any(|w| w.id == c.id)));
        assert!(results.iter().all(|c| c.rerank_score.is_some()));
    }

    #[tokio::test]
    async fn test_negative_boost_setting_keeps_salience_bounded() {
        let f = fixture().await;
        f.settings.set(keys::BOOST_RATE, "-2").await;

        f.service.search("apple pie", "documents", 3, true).await.unwrap();
        f.service.flush_background().await;

        for id in ["p1", "p2", "p3"] {
            let salience = salience_of(&f.index, "documents", id).await.unwrap();
            assert!((0.0..=1.0).contains(&salience), "{} escaped: {}", id, salience);
        }
        let top = salience_of(&f.index, "documents", "p1").await.unwrap();
        assert!((top - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_search_embeds_through_query_path() {
        let f = fixture().await;
        let embedder = Arc::new(MockEmbedder::with_keywords(32, KEYWORDS).with_instruction("Find recipes"));
        let service = SearchService::new(
            embedder.clone(),
            None,
            f.index.clone(),
            f.settings.clone(),
            Arc::new(AppConfig::default()),
        );

        service.search("apple pie", "documents", 2, false).await.unwrap();
        assert_eq!(embedder.query_inputs(), vec!["Instruct: Find recipes\nQuery: apple pie".to_string()]);
        assert!(embedder.document_inputs().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_collections_prepares_fresh_index() {
        let f = fixture().await;
        let index = Arc::new(InMemoryVectorIndex::new(f.embedder.dimension()));
        let service = SearchService::new(
            f.embedder.clone(),
            None,
            index.clone(),
            f.settings.clone(),
            Arc::new(AppConfig::default()),
        );

        let zero = vec![0.0; index.dimension()];
        assert!(index.search("documents", &zero, 1).await.is_err());
        service.ensure_collections().await.unwrap();
        assert!(!service.collections().is_empty());
        for collection in service.collections() {
            assert!(index.search(collection, &zero, 1).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_rerank_failure_falls_back_to_ann() {
        let f = fixture().await;
        f.reranker.set_failing(true);

        let results = f.service.search("apple", "documents", 2, true).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|c| c.rerank_score.is_none()));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

        f.service.flush_background().await;
        assert!(salience_of(&f.index, "documents", "p1").await.is_none());
    }

    #[tokio::test]
    async fn test_search_without_reranker_serves_ann_order() {
        let f = fixture().await;
        let service = SearchService::new(
            f.embedder.clone(),
            None,
            f.index.clone(),
            f.settings.clone(),
            Arc::new(AppConfig::default()),
        );

        let results = service.search("apple", "documents", 2, true).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_embedding_and_index_failures_propagate() {
        let f = fixture().await;

        let err = f.service.search("apple", "nowhere", 2, true).await.unwrap_err();
        assert!(matches!(err, AppError::CollectionNotFound { .. }));

        f.embedder.set_failing(true);
        let err = f.service.search("apple", "documents", 2, true).await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingError { .. }));
    }

    #[tokio::test]
    async fn test_empty_query_is_a_no_op() {
        let f = fixture().await;
        assert!(f.service.search("   ", "documents", 5, true).await.unwrap().is_empty());
        assert!(f.service.search_all("", 5, true).await.unwrap().is_empty());
        assert!(f.embedder.query_inputs().is_empty());
    }

    #[tokio::test]
    async fn test_search_all_tags_and_limits() {
        let f = fixture().await;

        for rerank in [false, true] {
            let results = f.service.search_all("apple engine", 5, rerank).await.unwrap();
            assert!(!results.is_empty());
            assert!(results.len() <= 5);
            for candidate in &results {
                let source = candidate.source_collection.as_deref().unwrap();
                assert!(f.index.point_exists(source, &candidate.id).await.unwrap());
            }
        }
        // One query embedding per search_all call, shared by both collections
        assert_eq!(f.embedder.query_inputs().len(), 2);
    }

    #[tokio::test]
    async fn test_rag_context_respects_settings() {
        let f = fixture().await;

        let context = f.service.build_rag_context("apple pie").await;
        assert!(!context.is_empty());
        assert!(context.text.contains("[documents]"));
        assert!(context.hits.len() <= 3);

        f.settings.set(keys::MAX_CHUNKS, "1").await;
        let context = f.service.build_rag_context("apple pie").await;
        assert_eq!(context.hits.len(), 1);

        f.embedder.set_failing(true);
        assert!(f.service.build_rag_context("apple pie").await.is_empty());
    }

    #[tokio::test]
    async fn test_record_usage_writes_back() {
        let f = fixture().await;
        let hits = f.service.search_all("apple pie", 2, false).await.unwrap();

        let scored = f
            .service
            .record_usage(&hits, "An apple pie needs a good recipe")
            .await;
        assert_eq!(scored.len(), hits.len());
        f.service.flush_background().await;

        let top = &scored[0];
        let payload = f
            .index
            .get_payload(top.hit.source_collection.as_deref().unwrap(), &top.hit.id)
            .await
            .unwrap()
            .unwrap();
        if top.usage_score > 0.3 || top.usage_score < 0.1 {
            assert!(payload.contains_key("last_usage_signal"));
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_writes() {
        let f = fixture().await;
        f.service.search("apple", "documents", 1, true).await.unwrap();
        f.service.shutdown(Duration::from_secs(5)).await;
        assert!(salience_of(&f.index, "documents", "p1").await.is_some());
    }
}
