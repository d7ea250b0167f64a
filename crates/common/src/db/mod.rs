//! Relational store access
//!
//! ATLAS only reads the application's relational store: the rows that get
//! embedded (documents, conversation messages, domain descriptions) and the
//! `settings` table. Queries are raw SQL through sea-orm so the same code
//! runs against SQLite and Postgres.

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::vector::Payload;
use async_trait::async_trait;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, QueryResult,
    Statement, Value as DbValue,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    pub conn: DatabaseConnection,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let mut opts = ConnectOptions::new(&config.url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let conn = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");
        Ok(Self { conn })
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.conn
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;
        Ok(())
    }

    pub fn backend(&self) -> DbBackend {
        self.conn.get_database_backend()
    }
}

/// Positional placeholder for the first bind parameter
pub(crate) fn first_placeholder(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Postgres => "$1",
        _ => "?",
    }
}

/// Kind of content row that can be embedded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Documents,
    Messages,
    Domains,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [Self::Documents, Self::Messages, Self::Domains];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Messages => "messages",
            Self::Domains => "domains",
        }
    }

    /// Logical collection the kind is indexed into.
    ///
    /// Domain descriptions share the documents collection.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Documents | Self::Domains => "documents",
            Self::Messages => "messages",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row ready for embedding
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRow {
    /// Point id in the target collection
    pub id: String,
    /// Text to embed
    pub text: String,
    /// Extra payload fields (title, type, timestamps)
    pub metadata: Payload,
}

impl ContentRow {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Payload::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Embedded text of a chat exchange
pub fn message_text(user_prompt: &str, model_response: &str) -> String {
    format!("Q: {}\nA: {}", user_prompt, model_response)
}

/// Point key of a domain description
pub fn domain_key(name: &str) -> String {
    format!("domain:{}", name)
}

/// Read access to the rows of each content kind
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Every candidate row of a kind
    async fn fetch_rows(&self, kind: ContentKind) -> Result<Vec<ContentRow>>;

    /// One row by its point id, `None` when absent
    async fn fetch_row(&self, kind: ContentKind, id: &str) -> Result<Option<ContentRow>>;
}

const DOCUMENTS_SQL: &str = "SELECT id, title, doc_type, source, content, created_at \
     FROM documents WHERE content IS NOT NULL";

const MESSAGES_SQL: &str = "SELECT m.id, m.conversation_id, m.sequence, \
     m.user_prompt, m.model_response, c.title AS conv_title \
     FROM messages m JOIN conversations c ON c.id = m.conversation_id \
     WHERE (m.user_prompt != '' OR m.model_response != '')";

const DOMAINS_SQL: &str = "SELECT name, display_name, description \
     FROM domains WHERE description IS NOT NULL";

/// Content source reading the application's tables
pub struct SqlContentSource {
    pool: DbPool,
}

fn text_at(row: &QueryResult, idx: usize) -> String {
    row.try_get_by_index::<Option<String>>(idx)
        .ok()
        .flatten()
        .unwrap_or_default()
}

fn document_row(row: &QueryResult) -> Result<ContentRow> {
    let id: String = row.try_get_by_index(0)?;
    Ok(ContentRow::new(id, text_at(row, 4))
        .with_field("title", json!(text_at(row, 1)))
        .with_field("doc_type", json!(text_at(row, 2)))
        .with_field("source", json!(text_at(row, 3)))
        .with_field("created_at", json!(text_at(row, 5))))
}

fn message_row(row: &QueryResult) -> Result<ContentRow> {
    let id: String = row.try_get_by_index(0)?;
    let sequence = row.try_get_by_index::<Option<i64>>(2).ok().flatten();
    let text = message_text(&text_at(row, 3), &text_at(row, 4));
    Ok(ContentRow::new(id, text)
        .with_field("conversation_id", json!(text_at(row, 1)))
        .with_field("sequence", json!(sequence))
        .with_field("conv_title", json!(text_at(row, 5))))
}

fn domain_row(row: &QueryResult) -> Result<ContentRow> {
    let name: String = row.try_get_by_index(0)?;
    let display_name = text_at(row, 1);
    let title = if display_name.is_empty() {
        name.clone()
    } else {
        display_name
    };
    let text = format!("{}: {}", title, text_at(row, 2));
    Ok(ContentRow::new(domain_key(&name), text)
        .with_field("title", json!(title))
        .with_field("doc_type", json!("domain"))
        .with_field("source", json!("domains")))
}

impl SqlContentSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn base_sql(kind: ContentKind) -> (&'static str, &'static str) {
        match kind {
            ContentKind::Documents => (DOCUMENTS_SQL, "id"),
            ContentKind::Messages => (MESSAGES_SQL, "m.id"),
            ContentKind::Domains => (DOMAINS_SQL, "name"),
        }
    }

    fn map_rows(kind: ContentKind, rows: Vec<QueryResult>) -> Result<Vec<ContentRow>> {
        let map = match kind {
            ContentKind::Documents => document_row,
            ContentKind::Messages => message_row,
            ContentKind::Domains => domain_row,
        };
        rows.iter().map(map).collect()
    }
}

#[async_trait]
impl ContentSource for SqlContentSource {
    async fn fetch_rows(&self, kind: ContentKind) -> Result<Vec<ContentRow>> {
        let (sql, _) = Self::base_sql(kind);
        let stmt = Statement::from_string(self.pool.backend(), sql.to_string());
        let rows = self.pool.conn.query_all(stmt).await?;
        debug!(kind = %kind, rows = rows.len(), "Fetched content rows");
        Self::map_rows(kind, rows)
    }

    async fn fetch_row(&self, kind: ContentKind, id: &str) -> Result<Option<ContentRow>> {
        let (sql, id_column) = Self::base_sql(kind);
        let key = match kind {
            ContentKind::Domains => id.strip_prefix("domain:").unwrap_or(id),
            _ => id,
        };
        let backend = self.pool.backend();
        let sql = format!("{} AND {} = {}", sql, id_column, first_placeholder(backend));
        let stmt = Statement::from_sql_and_values(backend, &sql, [DbValue::from(key.to_string())]);

        let row = self.pool.conn.query_one(stmt).await?;
        row.map(|r| Self::map_rows(kind, vec![r]))
            .transpose()
            .map(|rows| rows.and_then(|mut r| r.pop()))
    }
}

/// Fixed content for tests and embedding into other programs
#[derive(Default)]
pub struct StaticContentSource {
    rows: HashMap<ContentKind, Vec<ContentRow>>,
}

impl StaticContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, kind: ContentKind, rows: Vec<ContentRow>) -> Self {
        self.rows.entry(kind).or_default().extend(rows);
        self
    }
}

#[async_trait]
impl ContentSource for StaticContentSource {
    async fn fetch_rows(&self, kind: ContentKind) -> Result<Vec<ContentRow>> {
        Ok(self.rows.get(&kind).cloned().unwrap_or_default())
    }

    async fn fetch_row(&self, kind: ContentKind, id: &str) -> Result<Option<ContentRow>> {
        Ok(self
            .rows
            .get(&kind)
            .and_then(|rows| rows.iter().find(|r| r.id == id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_pool() -> DbPool {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let pool = DbPool::new(&config).await.unwrap();
        pool.conn
            .execute_unprepared(
                "CREATE TABLE documents (id TEXT PRIMARY KEY, title TEXT, doc_type TEXT, \
                 source TEXT, content TEXT, created_at TEXT);
                 CREATE TABLE conversations (id TEXT PRIMARY KEY, title TEXT);
                 CREATE TABLE messages (id TEXT PRIMARY KEY, conversation_id TEXT, \
                 sequence INTEGER, user_prompt TEXT, model_response TEXT);
                 CREATE TABLE domains (name TEXT PRIMARY KEY, display_name TEXT, description TEXT);
                 INSERT INTO documents VALUES ('d1', 'Pie', 'recipe', 'upload', 'apple pie recipe', '2025-01-01');
                 INSERT INTO documents VALUES ('d2', NULL, NULL, NULL, NULL, NULL);
                 INSERT INTO conversations VALUES ('c1', 'Baking');
                 INSERT INTO messages VALUES ('m1', 'c1', 1, 'how to bake', 'slowly');
                 INSERT INTO messages VALUES ('m2', 'c1', 2, '', '');
                 INSERT INTO domains VALUES ('atlas', 'Atlas', 'memory and retrieval');",
            )
            .await
            .unwrap();
        pool
    }

    #[test]
    fn test_kind_collections() {
        assert_eq!(ContentKind::Domains.collection(), "documents");
        assert_eq!(ContentKind::Messages.collection(), "messages");
        assert_eq!(ContentKind::Domains.to_string(), "domains");
    }

    #[test]
    fn test_message_text() {
        assert_eq!(message_text("hi", "hello"), "Q: hi\nA: hello");
    }

    #[tokio::test]
    async fn test_sql_documents() {
        let source = SqlContentSource::new(sqlite_pool().await);
        let rows = source.fetch_rows(ContentKind::Documents).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "d1");
        assert_eq!(rows[0].text, "apple pie recipe");
        assert_eq!(rows[0].metadata["title"], json!("Pie"));
    }

    #[tokio::test]
    async fn test_sql_messages_and_domains() {
        let source = SqlContentSource::new(sqlite_pool().await);

        let messages = source.fetch_rows(ContentKind::Messages).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Q: how to bake\nA: slowly");
        assert_eq!(messages[0].metadata["conv_title"], json!("Baking"));
        assert_eq!(messages[0].metadata["sequence"], json!(1));

        let domain = source
            .fetch_row(ContentKind::Domains, "domain:atlas")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(domain.text, "Atlas: memory and retrieval");
        assert_eq!(domain.metadata["doc_type"], json!("domain"));

        assert!(source
            .fetch_row(ContentKind::Documents, "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticContentSource::new()
            .with_rows(ContentKind::Documents, vec![ContentRow::new("a", "alpha text")]);
        assert_eq!(source.fetch_rows(ContentKind::Documents).await.unwrap().len(), 1);
        assert!(source.fetch_rows(ContentKind::Messages).await.unwrap().is_empty());
        assert!(source.fetch_row(ContentKind::Documents, "a").await.unwrap().is_some());
    }
}
