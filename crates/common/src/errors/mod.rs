//! Error types for ATLAS retrieval
//!
//! Provides a single error taxonomy for the model clients, the vector index
//! and the relational collaborators:
//! - Distinct error types for different failure modes
//! - Machine-readable error codes
//! - Classification of "backend unavailable" failures, which callers are
//!   expected to degrade around rather than surface

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    DimensionMismatch,

    // Resource errors (4xxx)
    NotFound,
    CollectionNotFound,
    PointNotFound,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    UpstreamError,
    EmbeddingError,
    EmbeddingTimeout,
    RerankError,
    RerankTimeout,
    VectorStoreError,
    ModelUnavailable,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::DimensionMismatch => 1002,

            ErrorCode::NotFound => 4001,
            ErrorCode::CollectionNotFound => 4002,
            ErrorCode::PointNotFound => 4003,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::EmbeddingTimeout => 8003,
            ErrorCode::RerankError => 8004,
            ErrorCode::RerankTimeout => 8005,
            ErrorCode::VectorStoreError => 8006,
            ErrorCode::ModelUnavailable => 8007,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("Point {id} not found in collection {collection}")]
    PointNotFound { collection: String, id: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Reranker error: {message}")]
    RerankError { message: String },

    #[error("Reranker timeout after {timeout_ms}ms")]
    RerankTimeout { timeout_ms: u64 },

    #[error("Vector store error: {message}")]
    VectorStore { message: String },

    #[error("Model {model} unavailable (last load failed: {reason}); retry in {retry_in_secs}s")]
    ModelUnavailable {
        model: String,
        reason: String,
        retry_in_secs: u64,
    },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::CollectionNotFound { .. } => ErrorCode::CollectionNotFound,
            AppError::PointNotFound { .. } => ErrorCode::PointNotFound,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::RerankError { .. } => ErrorCode::RerankError,
            AppError::RerankTimeout { .. } => ErrorCode::RerankTimeout,
            AppError::VectorStore { .. } => ErrorCode::VectorStoreError,
            AppError::ModelUnavailable { .. } => ErrorCode::ModelUnavailable,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// True when the failure means a model or vector backend could not serve
    /// the request (unreachable, erroring, timed out, or not loaded).
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::EmbeddingError { .. }
                | AppError::EmbeddingTimeout { .. }
                | AppError::RerankError { .. }
                | AppError::RerankTimeout { .. }
                | AppError::VectorStore { .. }
                | AppError::ModelUnavailable { .. }
                | AppError::HttpClient(_)
                | AppError::DatabaseConnection { .. }
        )
    }

    /// True for failures caused by bad input rather than a broken backend
    pub fn is_client_error(&self) -> bool {
        self.code().as_code() < 5000
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
