//! Embedding providers.
//!
//! The retrieval core only talks to the [`EmbeddingProvider`] trait; the
//! bundled implementation speaks the OpenAI-compatible `/embeddings` API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Request for generating embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Text to embed.
    pub text: String,

    /// Model to use (provider-specific).
    pub model: Option<String>,

    /// Per-call API key overriding the provider's configured key.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl EmbeddingRequest {
    /// Create a new embedding request.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            api_key: None,
        }
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Use a caller-supplied API key for this request only.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

/// Response from embedding generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The generated embedding.
    pub embedding: Embedding,

    /// Model used to generate the embedding.
    pub model: String,

    /// Dimension of the embedding.
    pub dimension: usize,

    /// Token usage (if available).
    pub tokens_used: Option<u64>,
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the default model for this provider.
    fn default_model(&self) -> &str;

    /// Generate an embedding for the given text.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Generate embeddings for multiple texts.
    async fn embed_batch(&self, requests: Vec<EmbeddingRequest>) -> Result<Vec<EmbeddingResponse>> {
        // Default implementation: process sequentially
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.embed(request).await?);
        }
        Ok(results)
    }

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool;

    /// Best-effort connection warm-up.
    async fn warm(&self) -> Result<()> {
        Ok(())
    }
}

/// OpenAI embedding provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Default model.
    default_model: String,

    /// Per-request timeout.
    timeout: Duration,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider using `OPENAI_API_KEY` from the environment.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            default_model: "text-embedding-3-large".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolve_key<'a>(&'a self, request_key: Option<&'a str>) -> Result<&'a str> {
        request_key
            .filter(|k| !k.is_empty())
            .or(self.api_key.as_deref())
            .ok_or(EmbeddingError::ProviderNotConfigured)
    }

    async fn post(&self, api_key: &str, body: serde_json::Value) -> Result<OpenAIEmbeddingResponse> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        if request.text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let api_key = self.resolve_key(request.api_key.as_deref())?;
        let model = request.model.unwrap_or_else(|| self.default_model.clone());

        debug!("Generating embedding with model: {model}");

        let body = serde_json::json!({
            "input": request.text,
            "model": model
        });

        let result = self.post(api_key, body).await?;

        let embedding = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".to_string()))?
            .embedding;
        if embedding.is_empty() {
            return Err(EmbeddingError::InvalidResponse(
                "Empty embedding in response".to_string(),
            ));
        }

        let dimension = embedding.len();
        let tokens_used = result.usage.map(|u| u.total_tokens);

        info!("Embedded query with model={model}, dim={dimension}");

        Ok(EmbeddingResponse {
            embedding,
            model,
            dimension,
            tokens_used,
        })
    }

    async fn embed_batch(&self, requests: Vec<EmbeddingRequest>) -> Result<Vec<EmbeddingResponse>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };

        let api_key = self.resolve_key(first.api_key.as_deref())?;
        let model = first
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let texts: Vec<&str> = requests.iter().map(|r| r.text.as_str()).collect();

        debug!(
            "Generating batch embeddings for {} texts with model: {model}",
            texts.len()
        );

        let body = serde_json::json!({
            "input": texts,
            "model": model
        });

        let mut result = self.post(api_key, body).await?;
        if result.data.len() != requests.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                requests.len(),
                result.data.len()
            )));
        }
        result.data.sort_by_key(|item| item.index);

        let responses: Vec<EmbeddingResponse> = result
            .data
            .into_iter()
            .map(|item| {
                let dimension = item.embedding.len();
                EmbeddingResponse {
                    embedding: item.embedding,
                    model: model.clone(),
                    dimension,
                    tokens_used: None,
                }
            })
            .collect();

        info!("Generated {} batch embeddings", responses.len());

        Ok(responses)
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn warm(&self) -> Result<()> {
        // Opens a pooled TLS connection to the API host; any HTTP status counts.
        self.client
            .get(format!("{}/models", self.base_url))
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(())
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAIProvider {
        OpenAIProvider::new()
            .with_base_url(server.uri())
            .with_api_key(Some("test-key".to_string()))
            .with_model("text-embedding-3-small")
    }

    #[test]
    fn test_embedding_request() {
        let request = EmbeddingRequest::new("Hello world")
            .with_model("text-embedding-3-small")
            .with_api_key(Some("sk-call".to_string()));

        assert_eq!(request.text, "Hello world");
        assert_eq!(request.model, Some("text-embedding-3-small".to_string()));
        assert_eq!(request.api_key.as_deref(), Some("sk-call"));
    }

    #[tokio::test]
    async fn test_embed_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "text-embedding-3-small",
                "input": "refund policy"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}],
                "model": "text-embedding-3-small",
                "usage": {"prompt_tokens": 2, "total_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server)
            .embed(EmbeddingRequest::new("refund policy"))
            .await
            .unwrap();

        assert_eq!(response.dimension, 3);
        assert_eq!(response.model, "text-embedding-3-small");
        assert_eq!(response.tokens_used, Some(2));
    }

    #[tokio::test]
    async fn test_request_api_key_overrides_configured_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer caller-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [1.0], "index": 0}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = EmbeddingRequest::new("hi").with_api_key(Some("caller-key".to_string()));
        assert!(provider(&server).embed(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .embed(EmbeddingRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::RateLimited { retry_after_secs: 7 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_base_url(server.uri())
            .with_api_key(None);
        let err = provider.embed(EmbeddingRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::ProviderNotConfigured));
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [2.0], "index": 1},
                    {"embedding": [1.0], "index": 0}
                ]
            })))
            .mount(&server)
            .await;

        let responses = provider(&server)
            .embed_batch(vec![EmbeddingRequest::new("a"), EmbeddingRequest::new("b")])
            .await
            .unwrap();
        let firsts: Vec<f32> = responses.iter().map(|r| r.embedding[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0]);
    }
}
