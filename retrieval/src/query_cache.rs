//! Two-tier cache of retrieval results.
//!
//! Tier 1 is an in-process LRU map with a TTL; tier 2 is an optional shared
//! key/value store. Lookups go local first and backfill the local tier from a
//! shared hit. Writes go to both tiers; shared-tier failures are only logged.
//!
//! Local slots are keyed without `k` and remember the `k` they were filled
//! with, so a request for fewer results is served by slicing.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{QueryCacheSettings, describe_url};
use crate::error::{Result, RetrievalError};
use crate::filter::MetadataFilter;
use crate::store::RetrievedItem;

/// Prefix of shared-tier keys; bump when the stored format changes.
pub const DISTRIBUTED_KEY_PREFIX: &str = "rag:v1:";

const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// Identity of a cached result list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheKey {
    slot: String,
    distributed: String,
    k: usize,
}

impl QueryCacheKey {
    /// Key for `query` against the (`user_id`, `agent_id`) table with `model`.
    pub fn new(
        query: &str,
        user_id: &str,
        agent_id: &str,
        k: usize,
        model: &str,
        filter: Option<&MetadataFilter>,
    ) -> Self {
        let filter = filter
            .filter(|f| !f.is_empty())
            .map(MetadataFilter::cache_fragment)
            .unwrap_or_default();
        let k_text = k.to_string();
        let fields = [query.trim(), user_id, agent_id, model, filter.as_str()];

        let slot = digest(&fields);
        let distributed = format!(
            "{DISTRIBUTED_KEY_PREFIX}{}",
            digest(&[query.trim(), user_id, agent_id, k_text.as_str(), model, filter.as_str()])
        );
        Self {
            slot,
            distributed,
            k,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Shared-tier key.
    pub fn distributed_key(&self) -> &str {
        &self.distributed
    }
}

fn digest(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update(FIELD_SEPARATOR);
    }
    format!("{:x}", hasher.finalize())
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Distributed,
}

struct LocalEntry {
    k: usize,
    items: Arc<Vec<RetrievedItem>>,
    stored_at: Instant,
}

impl LocalEntry {
    /// Whether this entry holds the first `k` results.
    fn covers(&self, k: usize) -> bool {
        // Fewer rows than requested means the table has no more.
        k <= self.k || self.items.len() < self.k
    }
}

/// Shared key/value store for the second tier.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Connectivity check used at warm-up.
    async fn ping(&self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Two-tier result cache.
pub struct QueryCache {
    local: RwLock<LruCache<String, LocalEntry>>,
    ttl: Duration,
    distributed: Option<Arc<dyn DistributedCache>>,
    distributed_ttl: Duration,
}

impl QueryCache {
    pub fn new(settings: &QueryCacheSettings, distributed: Option<Arc<dyn DistributedCache>>) -> Self {
        let capacity = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            local: RwLock::new(LruCache::new(capacity)),
            ttl: settings.ttl(),
            distributed,
            distributed_ttl: settings.distributed_ttl(),
        }
    }

    pub fn distributed_target(&self) -> Option<String> {
        self.distributed.as_ref().map(|cache| cache.describe())
    }

    /// The first `key.k()` cached results, if either tier has them.
    pub async fn get(&self, key: &QueryCacheKey) -> Option<(Vec<RetrievedItem>, CacheTier)> {
        if let Some(items) = self.get_local(key).await {
            return Some((items, CacheTier::Local));
        }

        let distributed = self.distributed.as_ref()?;
        let raw = match distributed.get(key.distributed_key()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Distributed cache read failed: {e}");
                return None;
            }
        };
        let mut items: Vec<RetrievedItem> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                warn!("Discarding undecodable distributed cache entry: {e}");
                return None;
            }
        };
        items.truncate(key.k());
        self.put_local(key, &items).await;
        Some((items, CacheTier::Distributed))
    }

    /// Store `items` in both tiers.
    pub async fn put(&self, key: &QueryCacheKey, items: &[RetrievedItem]) {
        let items = &items[..items.len().min(key.k())];
        self.put_local(key, items).await;

        if let Some(distributed) = &self.distributed {
            let write = match serde_json::to_string(items) {
                Ok(raw) => distributed
                    .set(key.distributed_key(), &raw, self.distributed_ttl)
                    .await,
                Err(e) => Err(RetrievalError::Serialization(e)),
            };
            if let Err(e) = write {
                warn!("Distributed cache write failed: {e}");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.local.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.local.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.local.write().await.clear();
    }

    /// Best-effort connectivity check of the shared tier.
    pub async fn warm(&self) {
        if let Some(distributed) = &self.distributed {
            match distributed.ping().await {
                Ok(()) => debug!("Distributed cache {} reachable", distributed.describe()),
                Err(e) => warn!("Distributed cache warm-up failed: {e}"),
            }
        }
    }

    async fn get_local(&self, key: &QueryCacheKey) -> Option<Vec<RetrievedItem>> {
        let stale = {
            let local = self.local.read().await;
            let entry = local.peek(&key.slot)?;
            if entry.stored_at.elapsed() <= self.ttl {
                if !entry.covers(key.k()) {
                    return None;
                }
                return Some(entry.items.iter().take(key.k()).cloned().collect());
            }
            entry.stored_at
        };

        let mut local = self.local.write().await;
        // Only drop the entry we judged stale; a writer may have replaced it.
        match local.peek(&key.slot) {
            Some(entry) if entry.stored_at == stale => {
                local.pop(&key.slot);
            }
            _ => {}
        }
        None
    }

    async fn put_local(&self, key: &QueryCacheKey, items: &[RetrievedItem]) {
        let entry = LocalEntry {
            k: key.k(),
            items: Arc::new(items.to_vec()),
            stored_at: Instant::now(),
        };
        self.local.write().await.push(key.slot.clone(), entry);
    }
}

/// Shared tier backed by an `UNLOGGED` PostgreSQL table.
pub struct PgCacheStore {
    pool: PgPool,
    target: String,
    ready: OnceCell<()>,
}

impl PgCacheStore {
    /// Table holding shared cache entries.
    pub const TABLE: &'static str = "rag_query_cache";

    /// Connections are opened on first use.
    pub fn connect_lazy(url: &str, connect_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(connect_timeout)
            .connect_lazy(url)?;
        Ok(Self {
            pool,
            target: describe_url(url),
            ready: OnceCell::new(),
        })
    }

    async fn ensure_table(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let ddl = format!(
                    "CREATE UNLOGGED TABLE IF NOT EXISTS {} (\
                     key TEXT PRIMARY KEY, \
                     value TEXT NOT NULL, \
                     expires_at TIMESTAMPTZ NOT NULL)",
                    Self::TABLE
                );
                sqlx::query(&ddl).execute(&self.pool).await?;
                Ok::<(), RetrievalError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DistributedCache for PgCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_table().await?;
        let query = format!(
            "SELECT value FROM {} WHERE key = $1 AND expires_at > now()",
            Self::TABLE
        );
        let value = sqlx::query_scalar::<_, String>(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_table().await?;
        let query = format!(
            "INSERT INTO {} (key, value, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE SET \
             value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            Self::TABLE
        );
        sqlx::query(&query)
            .bind(key)
            .bind(value)
            .bind(ttl.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_table().await
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

/// In-process shared tier, for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryDistributedCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    reads: AtomicU64,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl MemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, as an unreachable store would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RetrievalError::DistributedCache(
                "memory cache marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
