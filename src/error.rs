//! Error taxonomy for the ingestion and indexing pipeline.
//!
//! Chunk-level embedding failures are recovered locally by the batch
//! orchestrator and never surface as an `Error`; everything that can abort an
//! operation is enumerated here so callers can match on the failure class.

use thiserror::Error;

/// Pipeline-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid chunking or index parameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The source file could not be read or parsed.
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    /// Network or service failure from the embedding endpoint. Retryable.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// The embedding service returned a vector of the wrong width. Not retryable.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A duplicate in-flight job or index rebuild was requested.
    #[error("{operation} already in progress for {id}")]
    ConcurrencyConflict { operation: &'static str, id: String },

    /// A referenced document or project does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Loading or saving a vector index file failed.
    #[error("index i/o error: {0}")]
    IndexIo(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
