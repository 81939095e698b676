//! Retrieval engine implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, stream};
use rag_embeddings::{
    CacheStats, Embedder, EmbeddingProvider, EmbeddingVector, OpenAIProvider,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{MAX_BATCH_SIZE, RagConfig};
use crate::context;
use crate::dimension::TableDimensionResolver;
use crate::error::{Result, RetrievalError};
use crate::filter::MetadataFilter;
use crate::index::{IndexKind, IndexManager, SearchParams};
use crate::metrics::{MetricsCollector, RagMetrics};
use crate::postgres::PgVectorStore;
use crate::query_cache::{DistributedCache, PgCacheStore, QueryCache, QueryCacheKey};
use crate::sql::knowledge_table_name;
use crate::store::{PoolStats, RetrievedItem, ScoredRow, SimilarityQuery, VectorStore};

/// Top-k retrieval over per-(user, agent) knowledge tables.
///
/// One long-lived instance owns every cache, the vector store and the
/// metrics; callers share it behind an `Arc`. Public entry points never fail:
/// errors are logged, counted and turned into empty results.
pub struct RetrievalEngine {
    config: RagConfig,
    embedder: Embedder,
    store: Option<Arc<dyn VectorStore>>,
    dimensions: TableDimensionResolver,
    indexes: IndexManager,
    cache: QueryCache,
    metrics: MetricsCollector,
}

impl RetrievalEngine {
    /// Create a new engine builder.
    pub fn builder(config: RagConfig) -> RetrievalEngineBuilder {
        RetrievalEngineBuilder::new(config)
    }

    /// Build an engine with the PostgreSQL store and the OpenAI provider.
    pub async fn from_config(config: RagConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Build an engine from the process environment.
    pub async fn from_env() -> Result<Self> {
        Self::from_config(RagConfig::from_env()).await
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The `k` nearest passages for a query.
    pub async fn retrieve_topk(&self, request: RetrievalRequest) -> Vec<RetrievedItem> {
        if !self.config.enabled {
            debug!("Retrieval disabled; returning no context");
            return Vec::new();
        }

        let start = Instant::now();
        self.metrics.record_query();
        let k = normalize_top_k(request.top_k, self.config.default_top_k);

        let key = self.cache_key(&request, k);
        if let Some(key) = &key {
            if let Some(items) = self.lookup(key).await {
                self.metrics.record_latency(start.elapsed());
                return items;
            }
        }

        let items = self
            .retrieve_uncached(&request, k, key.as_ref(), request.query_vector.clone())
            .await;
        self.metrics.record_latency(start.elapsed());
        items
    }

    /// The `k` nearest passages for each query, in input order.
    ///
    /// Queries are scheduled in chunks of the configured batch size. Within a
    /// chunk, cached queries are answered directly, the distinct uncached
    /// texts are embedded in one provider batch, and retrievals run with no
    /// more concurrency than the store has connections.
    pub async fn retrieve_topk_batch(
        &self,
        request: BatchRetrievalRequest,
    ) -> Vec<Vec<RetrievedItem>> {
        let mut results = vec![Vec::new(); request.queries.len()];
        if !self.config.enabled || request.queries.is_empty() {
            return results;
        }

        self.metrics.record_batch();
        let k = normalize_top_k(request.top_k, self.config.default_top_k);
        let batch_size = self.config.batch_size.clamp(1, MAX_BATCH_SIZE);
        let concurrency = self
            .store
            .as_ref()
            .map_or(1, |store| store.max_connections().max(1));
        let model = self.embedder.primary_model().to_string();
        let api_key = request.api_key.as_deref();

        for (chunk_idx, chunk) in request.queries.chunks(batch_size).enumerate() {
            let offset = chunk_idx * batch_size;

            let mut pending = Vec::new();
            for (i, query) in chunk.iter().enumerate() {
                let query = query.trim();
                if query.is_empty() {
                    continue;
                }
                let start = Instant::now();
                self.metrics.record_query();
                let key = QueryCacheKey::new(
                    query,
                    &request.user_id,
                    &request.agent_id,
                    k,
                    &model,
                    request.metadata_filter.as_ref(),
                );
                match self.lookup(&key).await {
                    Some(items) => {
                        self.metrics.record_latency(start.elapsed());
                        results[offset + i] = items;
                    }
                    None => pending.push((offset + i, query, key, start)),
                }
            }
            if pending.is_empty() {
                continue;
            }

            let mut texts: Vec<&str> = pending.iter().map(|(_, query, _, _)| *query).collect();
            texts.sort_unstable();
            texts.dedup();
            let vectors = self.embed_queries(&texts, api_key).await;
            debug!(
                queries = chunk.len(),
                pending = pending.len(),
                embedded = vectors.len(),
                concurrency,
                "Processing retrieval batch {}",
                chunk_idx + 1
            );

            let retrievals = pending.iter().map(|(idx, query, key, start)| {
                let vector = vectors.get(query).cloned();
                let single = request.single(query);
                async move {
                    let items = match vector {
                        Some(vector) => {
                            self.retrieve_uncached(&single, k, Some(key), Some(vector))
                                .await
                        }
                        None => {
                            self.metrics.record_empty_result();
                            Vec::new()
                        }
                    };
                    self.metrics.record_latency(start.elapsed());
                    (*idx, items)
                }
            });
            let mut completed = stream::iter(retrievals).buffered(concurrency);
            while let Some((idx, items)) = completed.next().await {
                results[idx] = items;
            }
        }

        results
    }

    /// Embed `text` with exactly `model`, or with the configured model and
    /// its fallback when no model is given.
    pub async fn embed_text(
        &self,
        text: &str,
        api_key: Option<&str>,
        model: Option<&str>,
    ) -> Option<EmbeddingVector> {
        let embedded = match model {
            Some(model) => self.reembed(text, api_key, model, None).await,
            None => self.embed_query(text, api_key).await,
        };
        match embedded {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("Embedding text failed: {e}");
                None
            }
        }
    }

    /// Render retrieved items for a prompt.
    pub fn format_context(&self, items: &[RetrievedItem]) -> String {
        context::format_context(items, self.config.context_snippet_chars)
    }

    /// Pre-warm the embedding client, a store connection and the shared cache.
    ///
    /// Failures are logged only.
    pub async fn warm(&self) {
        if !self.config.enabled {
            debug!("Retrieval disabled; skipping warm-up");
            return;
        }

        self.embedder.warm().await;

        match &self.store {
            Some(store) => match store.acquire().await {
                Ok(mut conn) => match conn.ping().await {
                    Ok(()) => info!("Knowledge DB connection to {} warmed", store.describe()),
                    Err(e) => warn!("Knowledge DB warm-up failed: {e}"),
                },
                Err(e) => warn!("Knowledge DB warm-up failed: {e}"),
            },
            None => debug!("No knowledge DB configured; nothing to warm"),
        }

        self.cache.warm().await;
    }

    /// Effective configuration with secrets redacted, plus runtime state.
    pub async fn configuration(&self) -> RagConfiguration {
        RagConfiguration {
            config: self.config.redacted(),
            embedding_provider: self.embedder.provider().name().to_string(),
            embedding_provider_available: self.embedder.provider().is_available(),
            pool: self.store.as_ref().map(|store| store.stats()),
            distributed_cache: self.cache.distributed_target(),
            optimized_tables: self.indexes.optimized_tables(),
            query_cache_entries: self.cache.len().await,
            embedding_cache: self.embedder.cache().stats().await,
        }
    }

    pub fn metrics(&self) -> RagMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    fn cache_key(&self, request: &RetrievalRequest, k: usize) -> Option<QueryCacheKey> {
        let query = request.query.as_deref().map(str::trim).filter(|q| !q.is_empty())?;
        let model = request
            .query_vector
            .as_ref()
            .map_or(self.embedder.primary_model(), EmbeddingVector::model);
        Some(QueryCacheKey::new(
            query,
            &request.user_id,
            &request.agent_id,
            k,
            model,
            request.metadata_filter.as_ref(),
        ))
    }

    async fn lookup(&self, key: &QueryCacheKey) -> Option<Vec<RetrievedItem>> {
        match self.cache.get(key).await {
            Some((items, tier)) => {
                debug!(k = key.k(), "Query cache hit ({tier:?})");
                self.metrics.record_cache_hit(tier);
                Some(items)
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    async fn retrieve_uncached(
        &self,
        request: &RetrievalRequest,
        k: usize,
        key: Option<&QueryCacheKey>,
        vector: Option<EmbeddingVector>,
    ) -> Vec<RetrievedItem> {
        match self.try_retrieve(request, k, vector).await {
            Ok(items) => {
                if items.is_empty() {
                    self.metrics.record_empty_result();
                } else if let Some(key) = key {
                    self.cache.put(key, &items).await;
                }
                items
            }
            Err(e) => {
                warn!(
                    user_id = %request.user_id,
                    agent_id = %request.agent_id,
                    "Retrieval failed: {e}"
                );
                self.metrics.record_query_failure();
                self.metrics.record_empty_result();
                Vec::new()
            }
        }
    }

    async fn try_retrieve(
        &self,
        request: &RetrievalRequest,
        k: usize,
        vector: Option<EmbeddingVector>,
    ) -> Result<Vec<RetrievedItem>> {
        let table = knowledge_table_name(&request.user_id, &request.agent_id, self.config.table_naming)
            .ok_or_else(|| RetrievalError::InvalidTableName {
                user_id: request.user_id.clone(),
                agent_id: request.agent_id.clone(),
            })?;
        let filter = request.metadata_filter.as_ref().filter(|f| !f.is_empty());
        if let Some(filter) = filter {
            filter.validate()?;
        }
        let store = self.store.as_deref().ok_or_else(|| {
            RetrievalError::StoreUnavailable("no knowledge database configured".to_string())
        })?;

        let query = request.query.as_deref().map(str::trim).filter(|q| !q.is_empty());
        let api_key = request.api_key.as_deref();

        let vector = match (vector.filter(|v| !v.is_empty()), query) {
            (Some(vector), _) => vector,
            (None, Some(text)) => self.embed_query(text, api_key).await?,
            (None, None) => {
                debug!("No query text or vector supplied");
                return Ok(Vec::new());
            }
        };

        let dimension = self.dimensions.dimension_of(&table, store).await?;
        let vector = match dimension {
            Some(expected) if expected != vector.dimension() => {
                self.metrics.record_dimension_mismatch();
                info!(
                    table = %table,
                    "Query vector has {} dimensions but the table expects {expected}",
                    vector.dimension()
                );
                let model = self
                    .dimensions
                    .model_for_dimension(expected, self.embedder.fallback_model())
                    .ok_or(RetrievalError::UnknownModelDimension(expected))?;
                let text = query.ok_or(RetrievalError::DimensionMismatch {
                    expected,
                    actual: vector.dimension(),
                })?;
                let vector = self.reembed(text, api_key, &model, Some(expected)).await?;
                self.metrics.record_dimension_recovery();
                vector
            }
            _ => vector,
        };

        let kind = self
            .indexes
            .ensure_index(&table, dimension.or(Some(vector.dimension())), store)
            .await;
        let params = self.indexes.search_params(kind, self.indexes.estimated_rows(&table));

        let rows = match self.search(store, &table, &vector, k, filter, &params).await {
            Ok(rows) => rows,
            Err(e) if e.is_dimension_mismatch() => {
                self.metrics.record_dimension_mismatch();
                warn!(table = %table, "Store rejected the query vector ({e}); retrying once");
                let text = query.ok_or(e)?;

                let refreshed = self.dimensions.refresh(&table, store).await?;
                let model = refreshed
                    .and_then(|dim| self.dimensions.model_for_dimension(dim, None))
                    .or_else(|| self.alternate_model(vector.model()))
                    .ok_or(RetrievalError::UnknownModelDimension(
                        refreshed.unwrap_or(vector.dimension()),
                    ))?;
                let retry_vector = self.reembed(text, api_key, &model, refreshed).await?;
                let rows = self
                    .search(store, &table, &retry_vector, k, filter, &params)
                    .await?;
                self.metrics.record_dimension_recovery();
                rows
            }
            Err(e) => return Err(e),
        };

        let items: Vec<RetrievedItem> = rows.into_iter().take(k).map(RetrievedItem::from).collect();
        debug!(table = %table, k, index = %kind, "Retrieved {} items", items.len());
        Ok(items)
    }

    async fn search(
        &self,
        store: &dyn VectorStore,
        table: &str,
        vector: &EmbeddingVector,
        k: usize,
        filter: Option<&MetadataFilter>,
        params: &SearchParams,
    ) -> Result<Vec<ScoredRow>> {
        let query = SimilarityQuery {
            table: table.to_string(),
            vector: vector.values().to_vec(),
            limit: k,
            filter: filter.cloned(),
        };

        let mut conn = store.acquire().await?;
        match conn.apply_settings(&params.settings).await {
            Err(e) if e.poisons_connection() => Err(e),
            Err(e) => {
                debug!(table = %table, "Applying session settings failed: {e}");
                conn.similarity_search(&query).await
            }
            Ok(()) => conn.similarity_search(&query).await,
        }
    }

    async fn embed_query(&self, text: &str, api_key: Option<&str>) -> Result<EmbeddingVector> {
        self.metrics.record_embedding_call();
        self.embedder.embed(text, api_key).await.map_err(|e| {
            self.metrics.record_embedding_failure();
            RetrievalError::from(e)
        })
    }

    /// Embed distinct query texts through one provider batch.
    async fn embed_queries<'a>(
        &self,
        texts: &[&'a str],
        api_key: Option<&str>,
    ) -> HashMap<&'a str, EmbeddingVector> {
        let outcomes = self.embedder.embed_batch(texts, api_key).await;
        let mut vectors = HashMap::with_capacity(texts.len());
        for (text, outcome) in texts.iter().zip(outcomes) {
            self.metrics.record_embedding_call();
            match outcome {
                Ok(vector) => {
                    vectors.insert(*text, vector);
                }
                Err(e) => {
                    self.metrics.record_embedding_failure();
                    warn!("Embedding batch query failed: {e}");
                }
            }
        }
        vectors
    }

    /// Embed with exactly `model`, checking the output width.
    async fn reembed(
        &self,
        text: &str,
        api_key: Option<&str>,
        model: &str,
        expected: Option<usize>,
    ) -> Result<EmbeddingVector> {
        self.metrics.record_embedding_call();
        let vector = self
            .embedder
            .embed_with_model(text, api_key, model)
            .await
            .map_err(|e| {
                self.metrics.record_embedding_failure();
                RetrievalError::from(e)
            })?;
        match expected {
            Some(expected) if expected != vector.dimension() => Err(RetrievalError::DimensionMismatch {
                expected,
                actual: vector.dimension(),
            }),
            _ => {
                debug!("Re-embedded query with {model}");
                Ok(vector)
            }
        }
    }

    /// The other of the primary and fallback models.
    fn alternate_model(&self, current: &str) -> Option<String> {
        let primary = self.embedder.primary_model();
        let fallback = self.embedder.fallback_model()?;
        let alternate = if current == primary { fallback } else { primary };
        (alternate != current).then(|| alternate.to_string())
    }
}

/// `top_k` as requested, default when absent, never below one.
pub fn normalize_top_k(top_k: Option<i64>, default: usize) -> usize {
    match top_k {
        Some(k) => usize::try_from(k).unwrap_or(0).max(1),
        None => default.max(1),
    }
}

/// Parameters of one `retrieve_topk` call.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub user_id: String,
    pub agent_id: String,

    /// Query text; optional when `query_vector` is supplied.
    pub query: Option<String>,

    /// Requested result count; values below one are raised to one.
    pub top_k: Option<i64>,

    /// Overrides the configured embedding API key.
    pub api_key: Option<String>,

    /// Precomputed query embedding.
    pub query_vector: Option<EmbeddingVector>,

    pub metadata_filter: Option<MetadataFilter>,
}

impl RetrievalRequest {
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_top_k(mut self, top_k: i64) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_query_vector(mut self, vector: EmbeddingVector) -> Self {
        self.query_vector = Some(vector);
        self
    }

    pub fn with_metadata_filter(mut self, filter: MetadataFilter) -> Self {
        self.metadata_filter = Some(filter);
        self
    }
}

/// Parameters of one `retrieve_topk_batch` call.
#[derive(Debug, Clone, Default)]
pub struct BatchRetrievalRequest {
    pub user_id: String,
    pub agent_id: String,
    pub queries: Vec<String>,
    pub top_k: Option<i64>,
    pub api_key: Option<String>,
    pub metadata_filter: Option<MetadataFilter>,
}

impl BatchRetrievalRequest {
    pub fn new<I, S>(user_id: impl Into<String>, agent_id: impl Into<String>, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            queries: queries.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_top_k(mut self, top_k: i64) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_metadata_filter(mut self, filter: MetadataFilter) -> Self {
        self.metadata_filter = Some(filter);
        self
    }

    fn single(&self, query: &str) -> RetrievalRequest {
        RetrievalRequest {
            user_id: self.user_id.clone(),
            agent_id: self.agent_id.clone(),
            query: Some(query.to_string()),
            top_k: self.top_k,
            api_key: self.api_key.clone(),
            query_vector: None,
            metadata_filter: self.metadata_filter.clone(),
        }
    }
}

/// Read-only view of the engine's configuration and state.
#[derive(Debug, Clone, Serialize)]
pub struct RagConfiguration {
    pub config: RagConfig,
    pub embedding_provider: String,
    pub embedding_provider_available: bool,
    pub pool: Option<PoolStats>,
    pub distributed_cache: Option<String>,
    pub optimized_tables: Vec<(String, IndexKind)>,
    pub query_cache_entries: usize,
    pub embedding_cache: CacheStats,
}

/// Builder for [`RetrievalEngine`].
pub struct RetrievalEngineBuilder {
    config: RagConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn VectorStore>>,
    distributed: Option<Arc<dyn DistributedCache>>,
}

impl RetrievalEngineBuilder {
    pub fn new(config: RagConfig) -> Self {
        Self {
            config,
            provider: None,
            store: None,
            distributed: None,
        }
    }

    /// Use `provider` instead of the OpenAI-compatible HTTP provider.
    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use `store` instead of connecting to `knowledge_database_url`.
    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `cache` as the shared query cache tier.
    pub fn with_distributed_cache(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.distributed = Some(cache);
        self
    }

    /// Build the engine. A disabled engine opens no connections.
    pub async fn build(self) -> Result<RetrievalEngine> {
        let config = self.config.validated();

        let provider: Arc<dyn EmbeddingProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(openai_provider(&config)),
        };
        let embedder = Embedder::new(provider, config.embedder_config());

        let store = if config.enabled {
            match (self.store, config.knowledge_database_url.as_deref()) {
                (Some(store), _) => Some(store),
                (None, Some(url)) => Some(
                    Arc::new(PgVectorStore::connect(url, config.pool.clone()).await?)
                        as Arc<dyn VectorStore>,
                ),
                (None, None) => {
                    warn!("No knowledge database configured; retrieval will return no context");
                    None
                }
            }
        } else {
            info!("Retrieval disabled by configuration");
            None
        };

        let distributed = match self.distributed {
            Some(cache) => Some(cache),
            None if config.enabled => match config.query_cache.distributed_url.as_deref() {
                Some(url) => match PgCacheStore::connect_lazy(url, config.pool.connect_timeout()) {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn DistributedCache>),
                    Err(e) => {
                        warn!("Distributed query cache unavailable: {e}");
                        None
                    }
                },
                None => None,
            },
            None => None,
        };

        Ok(RetrievalEngine {
            dimensions: TableDimensionResolver::new(config.embedding.model_dimensions.clone()),
            indexes: IndexManager::new(config.index.clone()),
            cache: QueryCache::new(&config.query_cache, distributed),
            metrics: MetricsCollector::new(),
            embedder,
            store,
            config,
        })
    }
}

fn openai_provider(config: &RagConfig) -> OpenAIProvider {
    let provider = OpenAIProvider::new()
        .with_base_url(config.embedding.api_base.as_str())
        .with_model(config.embedding.model.as_str())
        .with_timeout(Duration::from_millis(config.embedding.timeout_ms));
    match &config.embedding.api_key {
        Some(key) => provider.with_api_key(Some(key.clone())),
        None => provider,
    }
}
