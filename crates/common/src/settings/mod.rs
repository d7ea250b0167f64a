//! Runtime-tunable settings
//!
//! Retrieval knobs live in the application's `settings(key, value)` table so
//! they can be changed without a restart. They are re-read on every call and
//! fall back to the loaded [`AppConfig`] when a key is missing or does not
//! parse.

use crate::config::{AppConfig, RetrievalConfig, SalienceConfig};
use crate::db::{first_placeholder, DbPool};
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, Statement, Value as DbValue};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Settings keys read by the retrieval path
pub mod keys {
    pub const RERANK_CANDIDATES: &str = "rag_rerank_candidates";
    pub const MAX_CHUNKS: &str = "rag_max_chunks";
    pub const SCORE_THRESHOLD: &str = "rag_score_threshold";
    pub const BOOST_RATE: &str = "rag_boost_rate";
    pub const USAGE_RATE: &str = "rag_usage_rate";
    pub const DECAY_RATE: &str = "rag_decay_rate";
}

/// Key-value settings lookup
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Raw value for `key`; `None` when unset or unreadable
    async fn get(&self, key: &str) -> Option<String>;
}

/// In-memory settings
#[derive(Default)]
pub struct StaticSettings {
    values: RwLock<HashMap<String, String>>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().await.insert(key.into(), value.into());
    }

    pub async fn remove(&self, key: &str) {
        self.values.write().await.remove(key);
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn get(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }
}

/// Settings read from the `settings` table
pub struct SqlSettings {
    pool: DbPool,
}

impl SqlSettings {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsProvider for SqlSettings {
    async fn get(&self, key: &str) -> Option<String> {
        let backend = self.pool.backend();
        let sql = format!(
            "SELECT value FROM settings WHERE key = {}",
            first_placeholder(backend)
        );
        let stmt = Statement::from_sql_and_values(backend, &sql, [DbValue::from(key.to_string())]);

        match self.pool.conn.query_one(stmt).await {
            Ok(Some(row)) => row.try_get_by_index::<Option<String>>(0).ok().flatten(),
            Ok(None) => None,
            Err(e) => {
                // An unreadable settings table degrades to configured defaults
                warn!(key, error = %e, "Settings lookup failed");
                None
            }
        }
    }
}

async fn read_or<T>(settings: &dyn SettingsProvider, key: &str, fallback: T) -> T
where
    T: FromStr + Copy,
{
    match settings.get(key).await {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                debug!(key, value = %raw, "Ignoring unparsable setting");
                fallback
            }
        },
        None => fallback,
    }
}

/// Salience rates must be finite and non-negative
async fn read_rate(settings: &dyn SettingsProvider, key: &str, fallback: f64) -> f64 {
    let value = read_or(settings, key, fallback).await;
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        warn!(key, value, "Ignoring out-of-range rate setting");
        fallback
    }
}

/// Effective retrieval and salience parameters for one call
#[derive(Debug, Clone)]
pub struct RetrievalTuning {
    pub retrieval: RetrievalConfig,
    pub salience: SalienceConfig,
}

impl RetrievalTuning {
    /// Configured values without any settings overrides
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retrieval: config.retrieval.clone(),
            salience: config.salience.clone(),
        }
    }

    /// Configured values overridden by the settings store
    pub async fn resolve(settings: &dyn SettingsProvider, config: &AppConfig) -> Self {
        let mut tuning = Self::from_config(config);
        let r = &mut tuning.retrieval;
        r.rerank_candidates = read_or(settings, keys::RERANK_CANDIDATES, r.rerank_candidates).await;
        r.max_context_chunks = read_or(settings, keys::MAX_CHUNKS, r.max_context_chunks).await;
        r.score_threshold = read_or(settings, keys::SCORE_THRESHOLD, r.score_threshold).await;

        let s = &mut tuning.salience;
        s.boost_rate = read_rate(settings, keys::BOOST_RATE, s.boost_rate).await;
        s.usage_rate = read_rate(settings, keys::USAGE_RATE, s.usage_rate).await;
        s.decay_rate = read_rate(settings, keys::DECAY_RATE, s.decay_rate).await;
        tuning
    }
}
