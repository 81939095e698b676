//! Error types for the retrieval engine.
//!
//! These never escape the public entry points of [`crate::RetrievalEngine`];
//! they are logged, counted and turned into empty results there.

use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the retrieval engine.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Embedding error.
    #[error("embedding error: {0}")]
    Embedding(#[from] rag_embeddings::EmbeddingError),

    /// Database error reported by the vector store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No connection became available within the pool timeout.
    #[error("connection pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// The vector store is not configured or unreachable.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// The server rejected a statement; carries the server's message.
    #[error("query failed: {0}")]
    Query(String),

    /// Query vector width differs from the table's column width.
    #[error("dimension mismatch: table expects {expected}, query vector has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// No known model produces vectors of the required width.
    #[error("no embedding model known for dimension {0}")]
    UnknownModelDimension(usize),

    /// User or agent id yields no usable table name.
    #[error("invalid knowledge table for user {user_id:?} and agent {agent_id:?}")]
    InvalidTableName { user_id: String, agent_id: String },

    /// Invalid metadata filter.
    #[error("invalid metadata filter: {0}")]
    InvalidFilter(String),

    /// Distributed cache error.
    #[error("distributed cache error: {0}")]
    DistributedCache(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RetrievalError {
    /// Classify a driver error: statements the server rejected become
    /// [`RetrievalError::Query`], everything else stays a driver error.
    pub fn from_driver(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db) => Self::Query(db.message().to_string()),
            other => Self::Database(other),
        }
    }

    /// Whether the store rejected the query because of mismatched vector
    /// widths (pgvector: "different vector dimensions 1536 and 3072").
    pub fn is_dimension_mismatch(&self) -> bool {
        match self {
            Self::DimensionMismatch { .. } => true,
            Self::Query(message) => message_reports_dimension_mismatch(message),
            _ => false,
        }
    }

    /// Whether the connection that produced this error should be discarded
    /// instead of being returned to the pool.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ) | Self::StoreUnavailable(_)
        )
    }
}

fn message_reports_dimension_mismatch(message: &str) -> bool {
    message.contains("vector dimensions")
}
