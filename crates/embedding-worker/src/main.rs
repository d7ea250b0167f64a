//! ATLAS Embedding Worker
//!
//! Operator entry point for the bulk embedding jobs:
//!
//! ```text
//! embedding-worker documents|messages|domains|all   backfill one or every kind
//! embedding-worker recreate                         drop and recreate collections
//! embedding-worker test [text]                      embed one passage
//! ```
//!
//! Jobs resume from the existing index, so an interrupted run can simply be
//! started again.

use anyhow::Context;
use atlas_common::{
    config::AppConfig,
    db::{ContentKind, DbPool, SqlContentSource},
    embeddings::create_embedder,
    metrics::{self, LATENCY_BUCKETS, METRICS_PREFIX, MODEL_BUCKETS},
    vector::create_index,
    VERSION,
};
use atlas_embedding_worker::{BulkEmbedError, BulkEmbedder, BulkSummary};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: embedding-worker <documents|messages|domains|all|recreate|test [text]>";

fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_search_duration_seconds", METRICS_PREFIX)),
            LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(Matcher::Suffix("_embedding_duration_seconds".to_string()), MODEL_BUCKETS)?
        .set_buckets_for_metric(Matcher::Suffix("_rerank_duration_seconds".to_string()), MODEL_BUCKETS)?
        .install()
        .context("failed to install Prometheus exporter")?;
    metrics::register_metrics();
    info!(%addr, "Metrics exporter listening");
    Ok(())
}

fn report(result: Result<BulkSummary, BulkEmbedError>) -> bool {
    match result {
        Ok(summary) => {
            println!(
                "{:<10} embedded={} skipped={} failed={} ({} ms)",
                summary.kind, summary.embedded, summary.skipped, summary.failed, summary.elapsed_ms
            );
            for e in &summary.errors {
                println!("  error: {}", e);
            }
            summary.failed == 0
        }
        Err(e) => {
            error!(error = %e, "Bulk job failed");
            eprintln!("Error: {}", e);
            false
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level)),
        )
        .with_target(true);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(service = %config.observability.service_name, "Starting ATLAS Embedding Worker v{}", VERSION);

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("all");

    if config.observability.metrics_port != 0 {
        install_exporter(config.observability.metrics_port)?;
    }

    let embedder = create_embedder(&config.embedding)?;
    info!(
        model = %embedder.model_name(),
        dimension = embedder.dimension(),
        "Embedder initialized"
    );
    let index = create_index(&config.vector, embedder.dimension())?;

    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    db.ping().await?;
    let job = BulkEmbedder::new(Arc::new(SqlContentSource::new(db)), embedder, index, &config);

    let ok = tokio::select! {
        _ = shutdown_signal() => {
            info!("Interrupted; rerun to resume from the indexed rows");
            false
        }
        ok = run(&job, &config, command, &args) => ok?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(job: &BulkEmbedder, config: &AppConfig, command: &str, args: &[String]) -> anyhow::Result<bool> {
    let ok = match command {
        "documents" => report(job.embed_kind(ContentKind::Documents).await),
        "messages" => report(job.embed_kind(ContentKind::Messages).await),
        "domains" => report(job.embed_kind(ContentKind::Domains).await),
        "all" => job
            .embed_all()
            .await
            .into_iter()
            .map(report)
            .fold(true, |acc, ok| acc && ok),
        "recreate" => {
            job.recreate(&config.vector.collections).await?;
            println!("Recreated: {}", config.vector.collections.join(", "));
            true
        }
        "test" => {
            let text = args
                .get(2)
                .cloned()
                .unwrap_or_else(|| "This is a test sentence for embedding.".to_string());
            let embedding = job.embed_single(&text).await?;
            println!("Embedding generated successfully!");
            println!("  Dimension: {}", embedding.len());
            println!("  First 5 values: {:?}", &embedding[..5.min(embedding.len())]);
            true
        }
        other => anyhow::bail!("unknown command '{}'\n{}", other, USAGE),
    };
    Ok(ok)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, stopping..."),
        _ = terminate => info!("Received SIGTERM, stopping..."),
    }
}
