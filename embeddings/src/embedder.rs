//! Cached embedding generation with bounded retries and model fallback.
//!
//! A call walks an ordered plan of models (the primary model, then the
//! configured fallback). Each step checks the cache, then calls the provider
//! up to `max_retries` times; the first success wins and is cached.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::EmbeddingVector;
use crate::cache::EmbeddingCache;
use crate::error::{EmbeddingError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingRequest};

/// Configuration for the [`Embedder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Primary model.
    pub model: String,

    /// Model tried once the primary model's retry budget is spent.
    pub fallback_model: Option<String>,

    /// Provider calls per model (at least one).
    pub max_retries: u32,

    /// Linear backoff step between retries of the same model.
    pub retry_backoff: Duration,

    /// Maximum age of a cached embedding.
    pub cache_ttl: Duration,

    /// Maximum number of cached embeddings.
    pub cache_capacity: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-large".to_string(),
            fallback_model: Some("text-embedding-3-small".to_string()),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 1024,
        }
    }
}

/// A single step of the fallback plan.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EmbedAttempt {
    model: String,
}

/// Embedding front door shared by all retrievals.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    config: EmbedderConfig,
}

impl Embedder {
    /// Create an embedder with its own cache.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbedderConfig) -> Self {
        let cache = EmbeddingCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            provider,
            cache,
            config,
        }
    }

    pub fn primary_model(&self) -> &str {
        &self.config.model
    }

    pub fn fallback_model(&self) -> Option<&str> {
        self.config.fallback_model.as_deref()
    }

    /// Get the underlying cache.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Ordered, de-duplicated models to try for a request.
    fn plan(&self) -> Vec<EmbedAttempt> {
        let first = self.config.model.as_str();
        let mut plan = vec![EmbedAttempt {
            model: first.to_string(),
        }];
        match self.config.fallback_model.as_deref() {
            Some(fallback) if fallback != first => plan.push(EmbedAttempt {
                model: fallback.to_string(),
            }),
            _ => {}
        }
        plan
    }

    /// Embed `text` with the primary model, falling back to the alternate
    /// model once every retry of the primary one failed.
    pub async fn embed(&self, text: &str, api_key: Option<&str>) -> Result<EmbeddingVector> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let plan = self.plan();
        let mut last_error = None;
        for step in &plan {
            match self.attempt(text, api_key, &step.model).await {
                Ok(vector) => return Ok(vector),
                Err(e) => {
                    warn!("Embedding with model {} failed: {e}", step.model);
                    last_error = Some(e);
                }
            }
        }

        let models = plan
            .iter()
            .map(|step| step.model.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Err(EmbeddingError::Exhausted {
            models,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Embed several texts, in input order.
    ///
    /// Cached texts are answered from the cache and the rest go to the
    /// provider in one batch call with the primary model. If that call fails,
    /// each remaining text is embedded on its own through [`Embedder::embed`].
    pub async fn embed_batch(
        &self,
        texts: &[&str],
        api_key: Option<&str>,
    ) -> Vec<Result<EmbeddingVector>> {
        let model = self.config.model.as_str();
        let mut results: Vec<Option<Result<EmbeddingVector>>> = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                results.push(Some(Err(EmbeddingError::EmptyInput)));
                continue;
            }
            match self.cache.get(text, model).await {
                Some(vector) => results.push(Some(Ok(vector))),
                None => {
                    results.push(None);
                    missing.push(i);
                }
            }
        }

        if !missing.is_empty() {
            let requests = missing
                .iter()
                .map(|&i| {
                    EmbeddingRequest::new(texts[i].trim())
                        .with_model(model)
                        .with_api_key(api_key.map(str::to_string))
                })
                .collect();
            match self.provider.embed_batch(requests).await {
                Ok(responses)
                    if responses.len() == missing.len()
                        && responses.iter().all(|r| !r.embedding.is_empty()) =>
                {
                    debug!("Embedded {} texts in one batch (model: {model})", missing.len());
                    for (&i, response) in missing.iter().zip(responses) {
                        let vector = EmbeddingVector::new(model, response.embedding);
                        self.cache.put(texts[i], vector.clone()).await;
                        results[i] = Some(Ok(vector));
                    }
                }
                Ok(responses) => warn!(
                    "Batch embedding returned {} usable vectors for {} texts; embedding one by one",
                    responses.iter().filter(|r| !r.embedding.is_empty()).count(),
                    missing.len()
                ),
                Err(e) => warn!("Batch embedding with {model} failed ({e}); embedding one by one"),
            }
        }

        let mut embedded = Vec::with_capacity(texts.len());
        for (text, result) in texts.iter().zip(results) {
            embedded.push(match result {
                Some(result) => result,
                None => self.embed(text, api_key).await,
            });
        }
        embedded
    }

    /// Embed `text` with exactly `model`; no fallback to another model.
    ///
    /// Used when the caller needs a specific output width.
    pub async fn embed_with_model(
        &self,
        text: &str,
        api_key: Option<&str>,
        model: &str,
    ) -> Result<EmbeddingVector> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        self.attempt(text, api_key, model).await
    }

    async fn attempt(&self, text: &str, api_key: Option<&str>, model: &str) -> Result<EmbeddingVector> {
        if let Some(vector) = self.cache.get(text, model).await {
            debug!("Cache hit for embedding (model: {model})");
            return Ok(vector);
        }

        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = EmbeddingRequest::new(text.trim())
                .with_model(model)
                .with_api_key(api_key.map(str::to_string));

            match self.provider.embed(request).await {
                Ok(response) => {
                    if response.embedding.is_empty() {
                        return Err(EmbeddingError::InvalidResponse(
                            "provider returned an empty embedding".to_string(),
                        ));
                    }
                    let vector = EmbeddingVector::new(model, response.embedding);
                    self.cache.put(text, vector.clone()).await;
                    return Ok(vector);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!("Embedding attempt {attempt}/{attempts} with {model} failed: {e}");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort warm-up of the provider connection.
    pub async fn warm(&self) {
        if !self.provider.is_available() {
            info!("Embedding provider {} has no API key configured", self.provider.name());
            return;
        }
        match self.provider.warm().await {
            Ok(()) => debug!("Embedding provider {} warmed", self.provider.name()),
            Err(e) => warn!("Embedding provider warm-up failed: {e}"),
        }
    }
}
