//! Vector store seams.
//!
//! The engine never talks to a database driver directly: it acquires a
//! [`VectorConnection`] from a [`VectorStore`]. Dropping the connection hands
//! it back to the store. The PostgreSQL/pgvector implementation lives in
//! [`crate::postgres`].

use async_trait::async_trait;
use rag_embeddings::similarity_from_distance;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::filter::MetadataFilter;

/// A bounded source of connections to the knowledge database.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Acquire a connection, waiting at most the store's acquire timeout.
    async fn acquire(&self) -> Result<Box<dyn VectorConnection>>;

    /// Upper bound on connections held at once.
    fn max_connections(&self) -> usize;

    fn stats(&self) -> PoolStats;

    /// Human-readable target for logs (no credentials).
    fn describe(&self) -> String;
}

/// A single read-only, auto-commit connection to the vector store.
///
/// Implementations that notice a broken connection must not hand it back to
/// their store when dropped.
#[async_trait]
pub trait VectorConnection: Send {
    /// Whether the connection is known to be unusable.
    fn is_closed(&self) -> bool;

    /// Round-trip check.
    async fn ping(&mut self) -> Result<()>;

    /// Configured width of the table's `embedding` column, if it can be read.
    async fn column_dimension(&mut self, table: &str) -> Result<Option<usize>>;

    /// Approximate row count of the table.
    async fn estimate_rows(&mut self, table: &str) -> Result<Option<u64>>;

    /// Run a statement that returns no rows (DDL, ANALYZE).
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Apply session settings for the statements that follow.
    async fn apply_settings(&mut self, settings: &SessionSettings) -> Result<()>;

    /// Nearest rows by cosine distance, ascending.
    async fn similarity_search(&mut self, query: &SimilarityQuery) -> Result<Vec<ScoredRow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    Pooled,
    /// One reused connection while the pool cannot be built.
    Single,
}

/// Snapshot of connection usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub mode: PoolMode,
    pub max_connections: usize,
    /// Open connections, leased or idle.
    pub size: usize,
    pub idle: usize,
}

/// Session settings applied before a similarity query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub statement_timeout_ms: u64,
    pub ivfflat_probes: Option<u32>,
    pub hnsw_ef_search: Option<u32>,
}

/// A top-k similarity query against one knowledge table.
#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub table: String,
    pub vector: Vec<f32>,
    pub limit: usize,
    pub filter: Option<MetadataFilter>,
}

/// A raw row returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRow {
    pub id: String,
    pub text: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub distance: f64,
}

/// A ranked passage returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub id: String,
    pub text: Option<String>,

    /// Opaque pass-through blob.
    pub metadata: Option<serde_json::Value>,

    /// Cosine distance as reported by the store.
    pub distance: f64,

    /// `clamp(1 - distance, -1, 1)`
    pub similarity: f64,
}

impl From<ScoredRow> for RetrievedItem {
    fn from(row: ScoredRow) -> Self {
        Self {
            similarity: similarity_from_distance(row.distance),
            id: row.id,
            text: row.text,
            metadata: row.metadata,
            distance: row.distance,
        }
    }
}
