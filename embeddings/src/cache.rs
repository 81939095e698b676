//! Embedding cache for avoiding redundant API calls.
//!
//! Entries are keyed on `(model, trimmed text)` and bounded both by age and
//! by count. Eviction is by insertion order: reads never reorder entries, so a
//! lookup only needs the shared side of the lock.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::EmbeddingVector;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    model: String,
    text: String,
}

impl CacheKey {
    fn new(text: &str, model: &str) -> Self {
        Self {
            model: model.to_string(),
            text: text.trim().to_string(),
        }
    }
}

/// Cache entry for an embedding.
#[derive(Debug, Clone)]
struct CacheEntry {
    vector: EmbeddingVector,
    created_at: Instant,
}

/// Cache for embeddings, shared by concurrent callers.
pub struct EmbeddingCache {
    entries: RwLock<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EmbeddingCache {
    /// Create a new in-memory cache holding at most `max_entries` vectors for
    /// at most `ttl` each.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get an embedding from the cache.
    ///
    /// A stale entry is reported as a miss and removed.
    pub async fn get(&self, text: &str, model: &str) -> Option<EmbeddingVector> {
        let key = CacheKey::new(text, model);

        {
            let entries = self.entries.read().await;
            match entries.peek(&key) {
                Some(entry) if entry.created_at.elapsed() <= self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.vector.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Stale: re-check under the write lock since a writer may have
        // refreshed the entry in between.
        let mut entries = self.entries.write().await;
        let fresh = entries
            .peek(&key)
            .filter(|entry| entry.created_at.elapsed() <= self.ttl)
            .map(|entry| entry.vector.clone());
        if fresh.is_none() {
            entries.pop(&key);
            debug!("Expired cached embedding (model: {model})");
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Put an embedding in the cache, evicting the oldest entry when full.
    pub async fn put(&self, text: &str, vector: EmbeddingVector) {
        let key = CacheKey::new(text, vector.model());
        let model = vector.model().to_string();
        let entry = CacheEntry {
            vector,
            created_at: Instant::now(),
        };

        let mut entries = self.entries.write().await;
        match entries.push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted oldest cached embedding (model: {})", evicted.model);
            }
            _ => {}
        }
        debug!("Cached embedding for text (model: {model})");
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let mut models: Vec<String> = entries.iter().map(|(k, _)| k.model.clone()).collect();
        models.sort();
        models.dedup();

        CacheStats {
            entries: entries.len(),
            max_entries: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            models,
        }
    }
}

/// Statistics about the embedding cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries in cache.
    pub entries: usize,

    /// Maximum cache size.
    pub max_entries: usize,

    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,

    /// Models with cached embeddings.
    pub models: Vec<String>,
}
