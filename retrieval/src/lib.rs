//! # Retrieval Engine
//!
//! Top-k passage retrieval for retrieval-augmented generation. Each
//! (user, agent) pair owns a pgvector knowledge table; a query is embedded,
//! reconciled with the table's vector width and answered by a cosine-distance
//! search.
//!
//! - **Query cache**: in-process LRU plus an optional shared tier
//! - **Embeddings**: cached, with retries and a fallback model
//! - **Connection pool**: sqlx pool, with a single-connection fallback
//! - **Dimension reconciliation**: re-embeds with a model of the table's width
//! - **Index management**: HNSW, IVFFLAT or sequential scan per table
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       RetrievalEngine                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  QueryCache (local LRU ─► distributed)                          │
//! │        │ miss                                                   │
//! │        ▼                                                        │
//! │  Embedder ─► TableDimensionResolver ─► IndexManager             │
//! │                                             │                   │
//! │                                             ▼                   │
//! │                              VectorStore ─► VectorConnection    │
//! │                                             │                   │
//! │                                             ▼                   │
//! │                               RetrievedItem[] ─► QueryCache     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rag_retrieval::{RagConfig, RetrievalEngine, RetrievalRequest};
//!
//! let engine = RetrievalEngine::from_config(RagConfig::from_env()).await?;
//! engine.warm().await;
//!
//! let items = engine
//!     .retrieve_topk(RetrievalRequest::new("7", "42").with_query("refund policy").with_top_k(3))
//!     .await;
//! println!("{}", engine.format_context(&items));
//! ```

pub mod config;
pub mod context;
pub mod dimension;
pub mod engine;
pub mod error;
pub mod filter;
pub mod index;
pub mod metrics;
pub mod postgres;
pub mod query_cache;
pub mod sql;
pub mod store;

pub use config::{
    EmbeddingSettings, IndexSettings, MAX_BATCH_SIZE, ModelDimension, PoolSettings,
    QueryCacheSettings, RagConfig, TableNaming,
};
pub use context::format_context;
pub use dimension::TableDimensionResolver;
pub use engine::{
    BatchRetrievalRequest, RagConfiguration, RetrievalEngine, RetrievalEngineBuilder,
    RetrievalRequest, normalize_top_k,
};
pub use error::{Result, RetrievalError};
pub use filter::{MetadataFilter, MetadataPredicate};
pub use index::{IndexKind, IndexManager, IndexStrategy, SearchParams};
pub use metrics::{MetricsCollector, RagMetrics};
pub use postgres::{POOL_RETRY_INTERVAL, PgVectorConnection, PgVectorStore};
pub use query_cache::{
    CacheTier, DistributedCache, MemoryDistributedCache, PgCacheStore, QueryCache, QueryCacheKey,
};
pub use store::{
    PoolMode, PoolStats, RetrievedItem, ScoredRow, SessionSettings, SimilarityQuery,
    VectorConnection, VectorStore,
};

// Re-export from dependencies for convenience
pub use rag_embeddings::{EmbeddingProvider, EmbeddingVector};
