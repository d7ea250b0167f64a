//! ATLAS search command
//!
//! Runs one query through the two-stage pipeline and prints the ranked
//! candidates as JSON.
//!
//! ```text
//! atlas-search [--collection NAME] [--limit N] [--no-rerank] [--context] <query>
//! ```
//!
//! Without `--collection` every configured collection is searched.
//! `--context` prints the chat context block instead of raw candidates.

use anyhow::Context;
use atlas_common::db::DbPool;
use atlas_common::embeddings::create_embedder;
use atlas_common::reranking::create_reranker;
use atlas_common::settings::{SettingsProvider, SqlSettings, StaticSettings};
use atlas_common::vector::create_index;
use atlas_common::{config::AppConfig, VERSION};
use atlas_search::SearchService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Args {
    collection: Option<String>,
    limit: Option<usize>,
    rerank: bool,
    context: bool,
    query: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        collection: None,
        limit: None,
        rerank: true,
        context: false,
        query: String::new(),
    };
    let mut words = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--collection" => args.collection = Some(iter.next().context("--collection needs a value")?),
            "--limit" => {
                let raw = iter.next().context("--limit needs a value")?;
                args.limit = Some(raw.parse().with_context(|| format!("invalid --limit: {}", raw))?);
            }
            "--no-rerank" => args.rerank = false,
            "--context" => args.context = true,
            _ => words.push(arg),
        }
    }

    args.query = words.join(" ");
    anyhow::ensure!(!args.query.trim().is_empty(), "usage: atlas-search [--collection NAME] [--limit N] [--no-rerank] [--context] <query>");
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level)),
        )
        .with_target(true)
        .with_writer(std::io::stderr);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(service = %config.observability.service_name, "Starting ATLAS search v{}", VERSION);
    let args = parse_args()?;
    let config = Arc::new(config);

    let embedder = create_embedder(&config.embedding)?;
    let reranker = create_reranker(&config.reranker)?;
    let index = create_index(&config.vector, config.embedding.dimension)?;

    // Tunables come from the settings table when the database is reachable
    let settings: Arc<dyn SettingsProvider> = match DbPool::new(&config.database).await {
        Ok(pool) => Arc::new(SqlSettings::new(pool)),
        Err(e) => {
            warn!(error = %e, "Settings store unavailable, using configured defaults");
            Arc::new(StaticSettings::new())
        }
    };

    let service = SearchService::new(embedder, reranker, index, settings, config.clone());
    service.ensure_collections().await?;
    let limit = args.limit.unwrap_or(config.retrieval.rerank_return);

    let output = if args.context {
        let context = service.build_rag_context(&args.query).await;
        serde_json::to_string_pretty(&context)?
    } else {
        let results = match &args.collection {
            Some(collection) => service.search(&args.query, collection, limit, args.rerank).await?,
            None => service.search_all(&args.query, limit, args.rerank).await?,
        };
        serde_json::to_string_pretty(&results)?
    };
    println!("{}", output);

    service.shutdown(Duration::from_secs(10)).await;
    Ok(())
}
