//! # Embeddings
//!
//! This crate turns query text into dense vectors for knowledge retrieval.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors through an
//!   OpenAI-compatible embeddings API
//! - **Caching**: TTL and capacity bounded memoization per model
//! - **Fallback**: Bounded retries per model, then one alternate model
//! - **Similarity**: Conversions between cosine distance and similarity
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Embeddings System                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Embedder ──► EmbeddingCache                                    │
//! │     │                                                           │
//! │     ▼                                                           │
//! │  [primary model × retries] ──► [fallback model × retries]       │
//! │     │                                                           │
//! │     ▼                                                           │
//! │  EmbeddingProvider (OpenAI-compatible HTTP)                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod embedder;
pub mod error;
pub mod provider;
pub mod similarity;

use serde::{Deserialize, Serialize};

pub use cache::{CacheStats, EmbeddingCache};
pub use embedder::{Embedder, EmbedderConfig};
pub use error::{EmbeddingError, Result};
pub use provider::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, OpenAIProvider};
pub use similarity::similarity_from_distance;

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// An embedding together with the model that produced it.
///
/// Immutable once produced; the dimension is the length of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    model: String,
    values: Embedding,
}

impl EmbeddingVector {
    /// Wrap raw values produced by `model`.
    pub fn new(model: impl Into<String>, values: Embedding) -> Self {
        Self {
            model: model.into(),
            values,
        }
    }

    /// Model identifier that produced this vector.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The vector components.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Embedding {
        self.values
    }
}
