//! Retrieval counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::query_cache::CacheTier;

/// Lock-free counters updated on every retrieval.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    queries: AtomicU64,
    batch_queries: AtomicU64,
    local_cache_hits: AtomicU64,
    distributed_cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    embedding_calls: AtomicU64,
    embedding_failures: AtomicU64,
    dimension_mismatches: AtomicU64,
    dimension_recoveries: AtomicU64,
    query_failures: AtomicU64,
    empty_results: AtomicU64,
    total_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batch_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::Local => &self.local_cache_hits,
            CacheTier::Distributed => &self.distributed_cache_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_embedding_call(&self) {
        self.embedding_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_embedding_failure(&self) {
        self.embedding_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dimension_mismatch(&self) {
        self.dimension_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dimension_recovery(&self) {
        self.dimension_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_failure(&self) {
        self.query_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_result(&self) {
        self.empty_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.total_latency_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RagMetrics {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let queries = load(&self.queries);
        let local_cache_hits = load(&self.local_cache_hits);
        let distributed_cache_hits = load(&self.distributed_cache_hits);
        let cache_hits = local_cache_hits + distributed_cache_hits;
        let cache_misses = load(&self.cache_misses);
        let total_latency_ms = load(&self.total_latency_ms);

        let lookups = cache_hits + cache_misses;
        RagMetrics {
            queries,
            batch_queries: load(&self.batch_queries),
            cache_hits,
            local_cache_hits,
            distributed_cache_hits,
            cache_misses,
            embedding_calls: load(&self.embedding_calls),
            embedding_failures: load(&self.embedding_failures),
            dimension_mismatches: load(&self.dimension_mismatches),
            dimension_recoveries: load(&self.dimension_recoveries),
            query_failures: load(&self.query_failures),
            empty_results: load(&self.empty_results),
            total_latency_ms,
            max_latency_ms: load(&self.max_latency_ms),
            avg_latency_ms: if queries == 0 {
                0.0
            } else {
                total_latency_ms as f64 / queries as f64
            },
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.queries,
            &self.batch_queries,
            &self.local_cache_hits,
            &self.distributed_cache_hits,
            &self.cache_misses,
            &self.embedding_calls,
            &self.embedding_failures,
            &self.dimension_mismatches,
            &self.dimension_recoveries,
            &self.query_failures,
            &self.empty_results,
            &self.total_latency_ms,
            &self.max_latency_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of [`MetricsCollector`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagMetrics {
    pub queries: u64,
    pub batch_queries: u64,
    pub cache_hits: u64,
    pub local_cache_hits: u64,
    pub distributed_cache_hits: u64,
    pub cache_misses: u64,
    pub embedding_calls: u64,
    pub embedding_failures: u64,
    pub dimension_mismatches: u64,
    pub dimension_recoveries: u64,
    pub query_failures: u64,
    pub empty_results: u64,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
    pub avg_latency_ms: f64,

    /// Hits over lookups, 0.0 before the first lookup.
    pub cache_hit_rate: f64,
}
