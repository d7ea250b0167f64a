//! Configuration management for ATLAS services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values
//!
//! Values that operators tune at runtime (candidate width, rates, thresholds)
//! are additionally overridable per call through [`crate::settings`].

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Relational store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Embedding backend configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Reranking backend configuration
    #[serde(default)]
    pub reranker: RerankerConfig,

    /// Vector backend configuration
    #[serde(default)]
    pub vector: VectorConfig,

    /// Two-stage retrieval parameters
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Salience feedback parameters
    #[serde(default)]
    pub salience: SalienceConfig,

    /// Usage signal parameters
    #[serde(default)]
    pub usage: UsageConfig,

    /// Bulk embedding job parameters
    #[serde(default)]
    pub bulk: BulkConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (sqlite:// or postgres://)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Which implementation backs a model client
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    /// Remote HTTP service
    Http,
    /// In-process ONNX model (requires the `local-models` feature)
    Local,
    /// Deterministic stub for tests and offline development
    Mock,
    /// Disabled (reranker only)
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: http, local, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: ModelProvider,

    /// API key for the embedding service
    pub api_key: Option<String>,

    /// API base URL (OpenAI-compatible `/embeddings` endpoint lives under it)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (fixed per deployment)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient failures
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Character ceiling applied before text reaches the model
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Instruction prepended on the query encoding path
    #[serde(default = "default_query_instruction")]
    pub query_instruction: String,

    /// How long a failed in-process model load is cached before retrying
    #[serde(default = "default_load_retry_cooldown")]
    pub load_retry_cooldown_secs: u64,
}

/// Scale of the raw scores a reranker backend emits
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScoreScale {
    /// Unbounded logits, normalised through a sigmoid
    Logit,
    /// Already a probability in [0, 1]
    Probability,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankerConfig {
    /// Reranker provider: http, local, mock, none
    #[serde(default = "default_reranker_provider")]
    pub provider: ModelProvider,

    /// API key for the reranking service
    pub api_key: Option<String>,

    /// API base URL (`/rerank` endpoint lives under it)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_reranker_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,

    /// Scale of backend scores
    #[serde(default = "default_score_scale")]
    pub score_scale: ScoreScale,

    /// Character ceiling applied to each candidate text
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Seconds a failed local model load is cached before retrying
    #[serde(default = "default_load_retry_cooldown")]
    pub load_retry_cooldown_secs: u64,
}

/// Which implementation backs the vector index
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorConfig {
    /// Vector backend: qdrant, memory
    #[serde(default = "default_vector_backend")]
    pub backend: VectorBackend,

    /// Qdrant REST URL
    #[serde(default = "default_vector_url")]
    pub url: String,

    /// Qdrant API key
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,

    /// Prefix for physical collection names (`{prefix}_{collection}`)
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,

    /// Logical collections searched by `search_all`
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// ANN candidates fetched before reranking
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,

    /// Results returned after reranking when the caller has no preference
    #[serde(default = "default_rerank_return")]
    pub rerank_return: usize,

    /// Minimum relevance for a hit to enter the RAG context
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,

    /// Maximum hits injected into the RAG context
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: usize,

    /// Characters of each hit's text shown in the RAG context
    #[serde(default = "default_context_chars")]
    pub context_chars_per_chunk: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SalienceConfig {
    /// Starting salience for points that have none
    #[serde(default = "default_salience")]
    pub default: f64,

    /// Boost per unit of rerank score
    #[serde(default = "default_boost_rate")]
    pub boost_rate: f64,

    /// Boost per unit of usage score
    #[serde(default = "default_usage_rate")]
    pub usage_rate: f64,

    /// Flat decay for ignored hits
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    /// Usage above this boosts
    #[serde(default = "default_usage_boost_threshold")]
    pub usage_boost_threshold: f64,

    /// Usage below this decays
    #[serde(default = "default_usage_decay_threshold")]
    pub usage_decay_threshold: f64,

    /// Rerank scores below this decay salience (disabled when unset)
    pub rerank_decay_threshold: Option<f64>,

    /// Decay applied when `rerank_decay_threshold` triggers
    #[serde(default)]
    pub rerank_decay_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageConfig {
    /// Keywords kept from the generated response
    #[serde(default = "default_response_keywords")]
    pub response_keywords: usize,

    /// Keywords kept from each hit
    #[serde(default = "default_hit_keywords")]
    pub hit_keywords: usize,

    /// Shortest word considered a keyword
    #[serde(default = "default_min_word_len")]
    pub min_word_len: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkConfig {
    /// Rows per embedding call
    #[serde(default = "default_bulk_batch_size")]
    pub batch_size: usize,

    /// Rows with less content than this are skipped
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,

    /// Assembled message texts shorter than this are skipped
    #[serde(default = "default_min_message_chars")]
    pub min_message_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default)]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_database_url() -> String { "sqlite://atlas.db?mode=rwc".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_embedding_provider() -> ModelProvider { ModelProvider::Http }
fn default_embedding_model() -> String { "nvidia/llama-nemotron-embed-1b-v2".to_string() }
fn default_embedding_dimension() -> usize { 2048 }
fn default_model_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_max_chars() -> usize { 8000 }
fn default_query_instruction() -> String {
    "Given a query, retrieve relevant documents that answer the query".to_string()
}
fn default_load_retry_cooldown() -> u64 { 300 }
fn default_reranker_provider() -> ModelProvider { ModelProvider::Http }
fn default_reranker_model() -> String { "nvidia/llama-nemotron-rerank-1b-v2".to_string() }
fn default_score_scale() -> ScoreScale { ScoreScale::Logit }
fn default_vector_backend() -> VectorBackend { VectorBackend::Qdrant }
fn default_vector_url() -> String { "http://localhost:6333".to_string() }
fn default_collection_prefix() -> String { "atlas".to_string() }
fn default_collections() -> Vec<String> { vec!["documents".to_string(), "messages".to_string()] }
fn default_rerank_candidates() -> usize { 20 }
fn default_rerank_return() -> usize { 5 }
fn default_score_threshold() -> f32 { 0.3 }
fn default_max_context_chunks() -> usize { 3 }
fn default_context_chars() -> usize { 500 }
fn default_salience() -> f64 { 0.5 }
fn default_boost_rate() -> f64 { 0.05 }
fn default_usage_rate() -> f64 { 0.05 }
fn default_decay_rate() -> f64 { 0.02 }
fn default_usage_boost_threshold() -> f64 { 0.3 }
fn default_usage_decay_threshold() -> f64 { 0.1 }
fn default_response_keywords() -> usize { 50 }
fn default_hit_keywords() -> usize { 15 }
fn default_min_word_len() -> usize { 3 }
fn default_bulk_batch_size() -> usize { 4 }
fn default_min_content_chars() -> usize { 10 }
fn default_min_message_chars() -> usize { 20 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_service_name() -> String { "atlas".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__VECTOR__URL=http://qdrant:6333
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            reranker: RerankerConfig::default(),
            vector: VectorConfig::default(),
            retrieval: RetrievalConfig::default(),
            salience: SalienceConfig::default(),
            usage: UsageConfig::default(),
            bulk: BulkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_model_timeout(),
            max_retries: default_embedding_retries(),
            max_chars: default_max_chars(),
            query_instruction: default_query_instruction(),
            load_retry_cooldown_secs: default_load_retry_cooldown(),
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_reranker_provider(),
            api_key: None,
            api_base: None,
            model: default_reranker_model(),
            timeout_secs: default_model_timeout(),
            score_scale: default_score_scale(),
            max_chars: default_max_chars(),
            load_retry_cooldown_secs: default_load_retry_cooldown(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            url: default_vector_url(),
            api_key: None,
            timeout_secs: default_model_timeout(),
            collection_prefix: default_collection_prefix(),
            collections: default_collections(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rerank_candidates: default_rerank_candidates(),
            rerank_return: default_rerank_return(),
            score_threshold: default_score_threshold(),
            max_context_chunks: default_max_context_chunks(),
            context_chars_per_chunk: default_context_chars(),
        }
    }
}

impl Default for SalienceConfig {
    fn default() -> Self {
        Self {
            default: default_salience(),
            boost_rate: default_boost_rate(),
            usage_rate: default_usage_rate(),
            decay_rate: default_decay_rate(),
            usage_boost_threshold: default_usage_boost_threshold(),
            usage_decay_threshold: default_usage_decay_threshold(),
            rerank_decay_threshold: None,
            rerank_decay_rate: 0.0,
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            response_keywords: default_response_keywords(),
            hit_keywords: default_hit_keywords(),
            min_word_len: default_min_word_len(),
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_bulk_batch_size(),
            min_content_chars: default_min_content_chars(),
            min_message_chars: default_min_message_chars(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: 0,
            service_name: default_service_name(),
        }
    }
}
