//! Metrics and observability utilities
//!
//! Prometheus-style counters and histograms with a shared `atlas_` prefix.
//! Recording is a no-op until a recorder is installed, so library code can
//! call these helpers unconditionally.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all ATLAS metrics
pub const METRICS_PREFIX: &str = "atlas";

/// Buckets for search latency (embed + ANN + rerank), in seconds
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
];

/// Buckets for model calls (embedding, reranking)
pub const MODEL_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of search queries"
    );

    describe_histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Search latency in seconds"
    );

    describe_gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        Unit::Count,
        "Number of results returned from the last search"
    );

    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding calls"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding errors"
    );

    describe_counter!(
        format!("{}_rerank_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total rerank calls"
    );

    describe_histogram!(
        format!("{}_rerank_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Rerank latency in seconds"
    );

    describe_counter!(
        format!("{}_rerank_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Searches that fell back to ANN order after a rerank failure"
    );

    describe_counter!(
        format!("{}_salience_writes_total", METRICS_PREFIX),
        Unit::Count,
        "Salience payload writes by signal and outcome"
    );

    describe_counter!(
        format!("{}_bulk_points_total", METRICS_PREFIX),
        Unit::Count,
        "Points handled by bulk embedding jobs"
    );

    tracing::info!("Metrics registered");
}

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

/// Record a completed search
pub fn record_search(duration_secs: f64, mode: &str, result_count: usize) {
    counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .set(result_count as f64);
}

/// Record an embedding call
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status(success)
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
        tracing::trace!(model, batch_size, duration_secs, "Embedding call recorded");
    } else {
        counter!(
            format!("{}_embedding_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }
}

/// Record a rerank call
pub fn record_rerank(duration_secs: f64, model: &str, candidates: usize, success: bool) {
    counter!(
        format!("{}_rerank_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status(success)
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_rerank_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
        tracing::trace!(model, candidates, duration_secs, "Rerank call recorded");
    }
}

/// Record a search that served ANN order because reranking failed
pub fn record_rerank_fallback(collection: &str) {
    counter!(
        format!("{}_rerank_fallbacks_total", METRICS_PREFIX),
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Record salience write outcomes for one batch of hits
pub fn record_salience_writes(signal: &str, updated: usize, skipped: usize, failed: usize) {
    for (outcome, count) in [("updated", updated), ("skipped", skipped), ("failed", failed)] {
        if count > 0 {
            counter!(
                format!("{}_salience_writes_total", METRICS_PREFIX),
                "signal" => signal.to_string(),
                "outcome" => outcome
            )
            .increment(count as u64);
        }
    }
}

/// Record the outcome of one bulk embedding batch
pub fn record_bulk_batch(kind: &str, embedded: usize, success: bool) {
    counter!(
        format!("{}_bulk_points_total", METRICS_PREFIX),
        "kind" => kind.to_string(),
        "status" => status(success)
    )
    .increment(embedded as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [LATENCY_BUCKETS, MODEL_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
    }

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every helper must be a silent no-op
        record_search(0.05, "rerank", 5);
        record_embedding(0.1, "mock", 4, false);
        record_rerank(0.2, "mock", 20, true);
        record_rerank_fallback("documents");
        record_salience_writes("rerank", 3, 1, 0);
        record_bulk_batch("messages", 4, true);
    }
}
