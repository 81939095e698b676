//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured (no API key).
    #[error("embedding provider not configured")]
    ProviderNotConfigured,

    /// Empty input text.
    #[error("cannot embed empty text")]
    EmptyInput,

    /// API request failed.
    #[error("API request failed with status {status}: {message}")]
    ApiRequest { status: u16, message: String },

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Every model in the fallback plan failed.
    #[error("all embedding attempts failed (models tried: {models}): {last}")]
    Exhausted { models: String, last: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbeddingError {
    /// Whether retrying the same request may succeed.
    ///
    /// Missing credentials and malformed input or responses are permanent;
    /// transport failures, timeouts, rate limits and server errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderNotConfigured
            | Self::EmptyInput
            | Self::InvalidResponse(_)
            | Self::Exhausted { .. }
            | Self::Serialization(_) => false,
            Self::ApiRequest { status, .. } => *status >= 500 || *status == 408,
            Self::RateLimited { .. } | Self::Http(_) => true,
        }
    }
}
