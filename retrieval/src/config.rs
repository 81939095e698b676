//! Configuration for the retrieval engine.
//!
//! Every knob has a default and can be overridden from environment-style
//! key/value pairs with [`RagConfig::from_env`] or [`RagConfig::from_lookup`].

use std::str::FromStr;
use std::time::Duration;

use rag_embeddings::EmbedderConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

/// Largest accepted batch size for `retrieve_topk_batch`.
pub const MAX_BATCH_SIZE: usize = 100;

/// Configuration for the retrieval engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Global switch; a disabled engine returns empty results without I/O.
    pub enabled: bool,

    /// Connection URL of the vector store.
    pub knowledge_database_url: Option<String>,

    /// How knowledge table names are derived from user and agent ids.
    pub table_naming: TableNaming,

    /// `top_k` used when the caller does not pass one.
    pub default_top_k: usize,

    /// Per-snippet character cap used by `format_context`.
    pub context_snippet_chars: usize,

    /// Queries processed per scheduling round in batch retrieval (1..=100).
    pub batch_size: usize,

    /// Embedding provider configuration.
    pub embedding: EmbeddingSettings,

    /// Query result cache configuration.
    pub query_cache: QueryCacheSettings,

    /// Connection pool configuration.
    pub pool: PoolSettings,

    /// ANN index and search parameter configuration.
    pub index: IndexSettings,
}

impl RagConfig {
    /// Create a configuration with default values pointing at `database_url`.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            knowledge_database_url: Some(database_url.into()),
            ..Self::default()
        }
    }

    /// Disable retrieval entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, settings: EmbeddingSettings) -> Self {
        self.embedding = settings;
        self
    }

    /// Set the query cache configuration.
    pub fn with_query_cache(mut self, settings: QueryCacheSettings) -> Self {
        self.query_cache = settings;
        self
    }

    /// Set the pool configuration.
    pub fn with_pool(mut self, settings: PoolSettings) -> Self {
        self.pool = settings;
        self
    }

    /// Set the index configuration.
    pub fn with_index(mut self, settings: IndexSettings) -> Self {
        self.index = settings;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };
        let defaults = Self::default();

        let knowledge_db_name = env
            .string("RAG_KNOWLEDGE_DB_NAME")
            .unwrap_or_else(|| "knowledge".to_string());
        let knowledge_database_url = resolve_knowledge_url(
            env.string("KNOWLEDGE_DATABASE_URL"),
            env.string("DATABASE_URL"),
            &knowledge_db_name,
        );

        let embedding = {
            let d = defaults.embedding;
            EmbeddingSettings {
                api_key: env.string("OPENAI_API_KEY"),
                api_base: env.string("EMBEDDING_API_BASE").unwrap_or(d.api_base),
                model: env.string("EMBEDDING_MODEL").unwrap_or(d.model),
                fallback_model: match env.string("EMBEDDING_FALLBACK_MODEL") {
                    Some(model) if model.eq_ignore_ascii_case("none") => None,
                    Some(model) => Some(model),
                    None => d.fallback_model,
                },
                timeout_ms: env.parse("EMBEDDING_TIMEOUT_MS", d.timeout_ms),
                max_retries: env.parse("EMBEDDING_MAX_RETRIES", d.max_retries),
                retry_backoff_ms: env.parse("EMBEDDING_RETRY_BACKOFF_MS", d.retry_backoff_ms),
                cache_ttl_secs: env.parse("EMBEDDING_CACHE_TTL_SECS", d.cache_ttl_secs),
                cache_capacity: env.parse("EMBEDDING_CACHE_CAPACITY", d.cache_capacity),
                model_dimensions: env
                    .string("RAG_MODEL_DIMENSIONS")
                    .map(|raw| parse_model_dimensions(&raw))
                    .filter(|hints| !hints.is_empty())
                    .unwrap_or(d.model_dimensions),
            }
        };

        let query_cache = {
            let d = defaults.query_cache;
            QueryCacheSettings {
                ttl_secs: env.parse("RAG_QUERY_CACHE_TTL_SECS", d.ttl_secs),
                capacity: env.parse("RAG_QUERY_CACHE_CAPACITY", d.capacity),
                distributed_url: env.string("RAG_DISTRIBUTED_CACHE_URL"),
                distributed_ttl_secs: env.parse("RAG_DISTRIBUTED_CACHE_TTL_SECS", d.distributed_ttl_secs),
            }
        };

        let pool = {
            let d = defaults.pool;
            PoolSettings {
                min_connections: env.parse("RAG_POOL_MIN", d.min_connections),
                max_connections: env.parse("RAG_POOL_MAX", d.max_connections),
                acquire_timeout_ms: env.parse("RAG_POOL_TIMEOUT_MS", d.acquire_timeout_ms),
                connect_timeout_ms: env.parse("RAG_CONNECT_TIMEOUT_MS", d.connect_timeout_ms),
            }
        };

        let index = {
            let d = defaults.index;
            IndexSettings {
                ann_dimension_limit: env.parse("RAG_ANN_DIMENSION_LIMIT", d.ann_dimension_limit),
                hnsw_enabled: env.flag("RAG_HNSW_ENABLED", d.hnsw_enabled),
                hnsw_min_dimension: env.parse("RAG_HNSW_MIN_DIMENSION", d.hnsw_min_dimension),
                hnsw_m: env.parse("RAG_HNSW_M", d.hnsw_m),
                hnsw_ef_construction: env.parse("RAG_HNSW_EF_CONSTRUCTION", d.hnsw_ef_construction),
                hnsw_ef_search: env.parse("RAG_HNSW_EF_SEARCH", d.hnsw_ef_search),
                ivfflat_lists: env.parse("RAG_IVFFLAT_LISTS", d.ivfflat_lists),
                ivfflat_probes: env.parse("RAG_IVFFLAT_PROBES", d.ivfflat_probes),
                ivfflat_max_probes: env.parse("RAG_IVFFLAT_MAX_PROBES", d.ivfflat_max_probes),
                statement_timeout_ms: env.parse("RAG_STATEMENT_TIMEOUT_MS", d.statement_timeout_ms),
                full_scan_timeout_ms: env.parse("RAG_FULL_SCAN_TIMEOUT_MS", d.full_scan_timeout_ms),
                index_build_timeout_ms: env.parse(
                    "RAG_INDEX_BUILD_TIMEOUT_MS",
                    d.index_build_timeout_ms,
                ),
            }
        };

        let table_naming = match env.string("RAG_TABLE_NAMING").as_deref() {
            Some("concatenated") => TableNaming::Concatenated,
            Some("joined") | None => TableNaming::Joined,
            Some(other) => {
                warn!("Unknown RAG_TABLE_NAMING {other:?}; using joined");
                TableNaming::Joined
            }
        };

        Self {
            enabled: env.flag("RAG_ENABLED", defaults.enabled),
            knowledge_database_url,
            table_naming,
            default_top_k: env.parse("RAG_DEFAULT_TOP_K", defaults.default_top_k),
            context_snippet_chars: env.parse("RAG_CONTEXT_SNIPPET_CHARS", defaults.context_snippet_chars),
            batch_size: env.parse("RAG_BATCH_SIZE", defaults.batch_size),
            embedding,
            query_cache,
            pool,
            index,
        }
        .validated()
    }

    /// Normalize out-of-range values instead of rejecting them.
    pub fn validated(mut self) -> Self {
        self.batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        self.default_top_k = self.default_top_k.max(1);
        self.pool.max_connections = self.pool.max_connections.max(1);
        self.pool.min_connections = self.pool.min_connections.min(self.pool.max_connections);
        self.index.ivfflat_probes = self.index.ivfflat_probes.max(1);
        self.index.ivfflat_max_probes = self.index.ivfflat_max_probes.max(self.index.ivfflat_probes);
        self.index.ivfflat_lists = self.index.ivfflat_lists.max(1);
        self
    }

    /// Copy safe to expose: API key and URL passwords are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.knowledge_database_url = config.knowledge_database_url.as_deref().map(redact_url);
        config.query_cache.distributed_url = config.query_cache.distributed_url.as_deref().map(redact_url);
        if config.embedding.api_key.is_some() {
            config.embedding.api_key = Some(REDACTED.to_string());
        }
        config
    }

    /// Settings for the embedding front door.
    pub fn embedder_config(&self) -> EmbedderConfig {
        EmbedderConfig {
            model: self.embedding.model.clone(),
            fallback_model: self.embedding.fallback_model.clone(),
            max_retries: self.embedding.max_retries,
            retry_backoff: Duration::from_millis(self.embedding.retry_backoff_ms),
            cache_ttl: Duration::from_secs(self.embedding.cache_ttl_secs),
            cache_capacity: self.embedding.cache_capacity,
        }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            knowledge_database_url: None,
            table_naming: TableNaming::Joined,
            default_top_k: 5,
            context_snippet_chars: 1000,
            batch_size: 16,
            embedding: EmbeddingSettings::default(),
            query_cache: QueryCacheSettings::default(),
            pool: PoolSettings::default(),
            index: IndexSettings::default(),
        }
    }
}

/// How a knowledge table name is built from the digits of the ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableNaming {
    /// `tb_<uid>_<aid>`
    Joined,
    /// `tb_<uid><aid>`
    Concatenated,
}

/// A known model output width, used for dimension reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDimension {
    pub model: String,
    pub dimension: usize,
}

impl ModelDimension {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
        }
    }
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// Default API key; a per-call key takes precedence.
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,

    /// Primary model.
    pub model: String,

    /// Alternate model tried after the primary model fails.
    pub fallback_model: Option<String>,

    /// Per-call timeout.
    pub timeout_ms: u64,

    /// Provider calls per model.
    pub max_retries: u32,

    /// Linear backoff step between retries.
    pub retry_backoff_ms: u64,

    /// Embedding cache TTL.
    pub cache_ttl_secs: u64,

    /// Embedding cache capacity.
    pub cache_capacity: usize,

    /// Known model output widths.
    pub model_dimensions: Vec<ModelDimension>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-large".to_string(),
            fallback_model: Some("text-embedding-3-small".to_string()),
            timeout_ms: 10_000,
            max_retries: 2,
            retry_backoff_ms: 200,
            cache_ttl_secs: 3600,
            cache_capacity: 1024,
            model_dimensions: vec![
                ModelDimension::new("text-embedding-3-large", 3072),
                ModelDimension::new("text-embedding-3-small", 1536),
                ModelDimension::new("text-embedding-ada-002", 1536),
            ],
        }
    }
}

/// Configuration for the query result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheSettings {
    /// Local tier TTL.
    pub ttl_secs: u64,

    /// Local tier capacity.
    pub capacity: usize,

    /// Endpoint of the shared tier; `None` disables it.
    pub distributed_url: Option<String>,

    /// Shared tier TTL.
    pub distributed_ttl_secs: u64,
}

impl QueryCacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn distributed_ttl(&self) -> Duration {
        Duration::from_secs(self.distributed_ttl_secs)
    }
}

impl Default for QueryCacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 512,
            distributed_url: None,
            distributed_ttl_secs: 900,
        }
    }
}

/// Configuration for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections opened eagerly when the pool is built.
    pub min_connections: usize,

    /// Upper bound on concurrently leased connections.
    pub max_connections: usize,

    /// How long `acquire` waits before reporting exhaustion.
    pub acquire_timeout_ms: u64,

    /// How long opening a single connection may take.
    pub connect_timeout_ms: u64,
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout_ms: 3000,
            connect_timeout_ms: 3000,
        }
    }
}

/// Configuration for ANN index provisioning and search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Above this width no index is attempted.
    pub ann_dimension_limit: usize,

    /// Whether HNSW may be provisioned.
    pub hnsw_enabled: bool,

    /// Lower bound of the width band that prefers HNSW.
    pub hnsw_min_dimension: usize,

    pub hnsw_m: u32,
    pub hnsw_ef_construction: u32,

    /// Search-time recall knob for HNSW.
    pub hnsw_ef_search: u32,

    /// IVFFLAT build lists.
    pub ivfflat_lists: u32,

    /// IVFFLAT probes for small tables.
    pub ivfflat_probes: u32,

    /// Upper bound on scaled IVFFLAT probes.
    pub ivfflat_max_probes: u32,

    /// Statement timeout for indexed searches.
    pub statement_timeout_ms: u64,

    /// Statement timeout for sequential scans and huge tables.
    pub full_scan_timeout_ms: u64,

    /// Statement timeout for index creation and ANALYZE.
    pub index_build_timeout_ms: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            ann_dimension_limit: 2000,
            hnsw_enabled: true,
            hnsw_min_dimension: 1024,
            hnsw_m: 16,
            hnsw_ef_construction: 64,
            hnsw_ef_search: 100,
            ivfflat_lists: 100,
            ivfflat_probes: 10,
            ivfflat_max_probes: 100,
            statement_timeout_ms: 5000,
            full_scan_timeout_ms: 30_000,
            index_build_timeout_ms: 300_000,
        }
    }
}

const REDACTED: &str = "***";

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Ignoring unparseable {key}={raw:?}; using default");
                default
            }),
            None => default,
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.string(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => {
                warn!("Ignoring unparseable {key}={other:?}; using default");
                default
            }
            None => default,
        }
    }
}

/// Parse `model=dim,model=dim` hints, skipping malformed pairs.
fn parse_model_dimensions(raw: &str) -> Vec<ModelDimension> {
    raw.split(',')
        .filter_map(|pair| {
            let (model, dimension) = pair.split_once('=')?;
            let dimension = dimension.trim().parse().ok()?;
            let model = model.trim();
            (!model.is_empty()).then(|| ModelDimension::new(model, dimension))
        })
        .collect()
}

/// Pick the knowledge store URL: an explicit URL wins, otherwise the primary
/// database URL is re-pointed at the knowledge database.
pub fn resolve_knowledge_url(
    explicit: Option<String>,
    database_url: Option<String>,
    knowledge_db_name: &str,
) -> Option<String> {
    if let Some(url) = explicit {
        info!("Knowledge DB set via env: {}", describe_url(&url));
        return Some(url);
    }

    let mut url = Url::parse(&database_url?).ok()?;
    url.set_path(&format!("/{knowledge_db_name}"));
    url.set_query(None);
    url.set_fragment(None);
    info!("Knowledge DB derived from DATABASE_URL -> {knowledge_db_name}");
    Some(url.to_string())
}

/// `//host:port/database` without credentials, for logs.
pub fn describe_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => format!(
            "//{}:{}{}",
            url.host_str().unwrap_or_default(),
            url.port().map(|p| p.to_string()).unwrap_or_default(),
            url.path()
        ),
        Err(_) => "<unparseable url>".to_string(),
    }
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                // Only fails for URLs that cannot carry credentials.
                let _ = url.set_password(Some(REDACTED));
            }
            url.to_string()
        }
        Err(_) => REDACTED.to_string(),
    }
}
