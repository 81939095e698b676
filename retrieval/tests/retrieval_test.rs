//! End-to-end tests of the retrieval engine against in-memory fakes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rag_retrieval::{
    BatchRetrievalRequest, DistributedCache, EmbeddingVector, MemoryDistributedCache,
    MetadataFilter, PoolMode, PoolSettings, RagConfig, RetrievalEngine, RetrievalRequest,
    RetrievedItem,
};

use common::{FakeProvider, FakeStore, FakeTable, LARGE_MODEL, SMALL_MODEL, approx_eq, config};

fn refund_table() -> FakeTable {
    FakeTable::new(1536)
        .with_row("c", "Refunds after 90 days need approval.", 0.9)
        .with_row("a", "Refunds are accepted within 30 days.", 0.1)
        .with_row("b", "Keep the receipt for refunds.", 0.4)
}

async fn engine(config: RagConfig, provider: &Arc<FakeProvider>, store: &FakeStore) -> RetrievalEngine {
    RetrievalEngine::builder(config)
        .with_embedding_provider(provider.clone())
        .with_vector_store(store.store())
        .build()
        .await
        .unwrap()
}

fn refund_request(top_k: i64) -> RetrievalRequest {
    RetrievalRequest::new("user-7", "agent-42")
        .with_query("refund policy")
        .with_top_k(top_k)
}

fn ids(items: &[RetrievedItem]) -> Vec<&str> {
    items.iter().map(|item| item.id.as_str()).collect()
}

fn single_connection_pool(acquire_timeout_ms: u64) -> PoolSettings {
    PoolSettings {
        min_connections: 0,
        max_connections: 1,
        acquire_timeout_ms,
        connect_timeout_ms: 100,
    }
}

/// Shared tier that answers slowly.
struct SlowCache {
    inner: MemoryDistributedCache,
    delay: Duration,
}

#[async_trait]
impl DistributedCache for SlowCache {
    async fn get(&self, key: &str) -> rag_retrieval::Result<Option<String>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> rag_retrieval::Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn ping(&self) -> rag_retrieval::Result<()> {
        self.inner.ping().await
    }

    fn describe(&self) -> String {
        "slow".to_string()
    }
}

#[tokio::test]
async fn test_end_to_end_top_two() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(2)).await;

    assert_eq!(ids(&items), vec!["a", "b"]);
    let distances: Vec<f64> = items.iter().map(|item| item.distance).collect();
    let similarities: Vec<f64> = items.iter().map(|item| item.similarity).collect();
    assert!(approx_eq(&distances, &[0.1, 0.4]), "distances: {distances:?}");
    assert!(approx_eq(&similarities, &[0.9, 0.6]), "similarities: {similarities:?}");
    assert_eq!(provider.calls_for_model(SMALL_MODEL), 1);
}

#[tokio::test]
async fn test_repeated_query_is_served_from_cache() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let first = engine.retrieve_topk(refund_request(3)).await;
    let second = engine.retrieve_topk(refund_request(3)).await;

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(provider.calls(), 1);
    assert_eq!(store.searches(), 1);

    let metrics = engine.metrics();
    assert_eq!(metrics.queries, 2);
    assert_eq!(metrics.local_cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
}

#[tokio::test]
async fn test_smaller_k_is_sliced_from_cached_entry() {
    let provider = FakeProvider::new();
    let mut table = FakeTable::new(1536);
    for i in 0..6 {
        table = table.with_row(&format!("r{i}"), &format!("passage {i}"), 0.1 * f64::from(i));
    }
    let store = FakeStore::new().with_table("tb_7_42", table);
    let engine = engine(config(), &provider, &store).await;

    let five = engine.retrieve_topk(refund_request(5)).await;
    let three = engine.retrieve_topk(refund_request(3)).await;

    assert_eq!(five.len(), 5);
    assert_eq!(three, five[..3].to_vec());
    assert_eq!(store.searches(), 1);
}

#[tokio::test]
async fn test_non_positive_top_k_returns_one_item() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    assert_eq!(ids(&engine.retrieve_topk(refund_request(0)).await), vec!["a"]);
    assert_eq!(ids(&engine.retrieve_topk(refund_request(-4)).await), vec!["a"]);
}

#[tokio::test]
async fn test_disabled_engine_makes_no_calls() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let mut config = config();
    config.enabled = false;
    let engine = engine(config, &provider, &store).await;

    engine.warm().await;
    assert!(engine.retrieve_topk(refund_request(2)).await.is_empty());
    let batch = engine
        .retrieve_topk_batch(BatchRetrievalRequest::new("7", "42", ["refund policy"]))
        .await;

    assert_eq!(batch, vec![Vec::<RetrievedItem>::new()]);
    assert_eq!(provider.calls(), 0);
    assert_eq!(store.connects(), 0);
    assert_eq!(store.searches(), 0);
}

#[tokio::test]
async fn test_mismatched_embedding_is_reembedded_with_matching_model() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let mut config = config();
    config.embedding.model = LARGE_MODEL.to_string();
    config.embedding.fallback_model = Some(SMALL_MODEL.to_string());
    let engine = engine(config, &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(2)).await;

    assert_eq!(ids(&items), vec!["a", "b"]);
    assert_eq!(provider.calls_for_model(LARGE_MODEL), 1);
    assert_eq!(provider.calls_for_model(SMALL_MODEL), 1);
    assert_eq!(store.searches(), 1);

    let metrics = engine.metrics();
    assert_eq!(metrics.dimension_mismatches, 1);
    assert_eq!(metrics.dimension_recoveries, 1);
}

#[tokio::test]
async fn test_mismatch_without_known_model_returns_empty() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", FakeTable::new(768).with_row("a", "x", 0.1));
    let engine = engine(config(), &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(2)).await;

    assert!(items.is_empty());
    assert_eq!(store.searches(), 0, "a mismatched vector must never be queried");
    assert_eq!(engine.metrics().query_failures, 1);
}

#[tokio::test]
async fn test_store_dimension_error_triggers_one_retry() {
    let provider = FakeProvider::new();
    // The catalog first claims 3072, the column really holds 1536.
    let store = FakeStore::new().with_table("tb_7_42", refund_table().reporting_first(3072));
    let mut config = config();
    config.embedding.model = LARGE_MODEL.to_string();
    config.embedding.fallback_model = Some(SMALL_MODEL.to_string());
    let engine = engine(config, &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(2)).await;

    assert_eq!(ids(&items), vec!["a", "b"]);
    assert_eq!(store.searches(), 2);
    assert_eq!(store.probes(), 2);
    assert_eq!(provider.calls_for_model(SMALL_MODEL), 1);
    assert_eq!(engine.metrics().dimension_recoveries, 1);
}

#[tokio::test]
async fn test_second_dimension_error_returns_empty() {
    let provider = FakeProvider::new();
    // Every probe claims 3072 while the column holds 1536.
    let store = FakeStore::new().with_table(
        "tb_7_42",
        refund_table().reporting_first(3072).reporting_first(3072),
    );
    let mut config = config();
    config.embedding.model = LARGE_MODEL.to_string();
    config.embedding.fallback_model = Some(SMALL_MODEL.to_string());
    let engine = engine(config, &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(2)).await;

    assert!(items.is_empty());
    assert_eq!(engine.metrics().query_failures, 1);
}

#[tokio::test]
async fn test_precomputed_vector_skips_embedding() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let request = RetrievalRequest::new("7", "42")
        .with_query_vector(EmbeddingVector::new(SMALL_MODEL, vec![0.2; 1536]))
        .with_top_k(1);
    let items = engine.retrieve_topk(request).await;

    assert_eq!(ids(&items), vec!["a"]);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_missing_query_and_vector_returns_empty() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let items = engine
        .retrieve_topk(RetrievalRequest::new("7", "42").with_query("   "))
        .await;

    assert!(items.is_empty());
    assert_eq!(provider.calls(), 0);
    assert_eq!(store.searches(), 0);
    assert_eq!(engine.metrics().query_failures, 0);
}

#[tokio::test]
async fn test_ids_without_digits_return_empty() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let items = engine
        .retrieve_topk(RetrievalRequest::new("anonymous", "agent").with_query("refund policy"))
        .await;

    assert!(items.is_empty());
    assert_eq!(store.searches(), 0);
}

#[tokio::test]
async fn test_embedding_failure_degrades_to_empty() {
    let provider = FakeProvider::new();
    provider.fail_model(SMALL_MODEL);
    provider.fail_model(LARGE_MODEL);
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(2)).await;

    assert!(items.is_empty());
    // Primary then fallback.
    assert_eq!(provider.calls(), 2);
    let metrics = engine.metrics();
    assert_eq!(metrics.embedding_failures, 1);
    assert_eq!(metrics.query_failures, 1);
    assert_eq!(store.searches(), 0);
}

#[tokio::test]
async fn test_metadata_filter_narrows_results() {
    let provider = FakeProvider::new();
    let table = FakeTable::new(1536)
        .with_metadata_row("en-1", serde_json::json!({"lang": "en", "source": "faq"}), 0.2)
        .with_metadata_row("de-1", serde_json::json!({"lang": "de", "source": "faq"}), 0.1)
        .with_metadata_row("en-2", serde_json::json!({"lang": "en", "source": "blog"}), 0.3);
    let store = FakeStore::new().with_table("tb_7_42", table);
    let engine = engine(config(), &provider, &store).await;

    let filter = MetadataFilter::new()
        .equals("lang", "en")
        .contains(&serde_json::json!({"source": "faq"}));
    let items = engine
        .retrieve_topk(refund_request(5).with_metadata_filter(filter))
        .await;
    assert_eq!(ids(&items), vec!["en-1"]);

    // The unfiltered query is cached separately.
    let items = engine.retrieve_topk(refund_request(5)).await;
    assert_eq!(ids(&items), vec!["de-1", "en-1", "en-2"]);
    assert_eq!(store.searches(), 2);
}

#[tokio::test]
async fn test_invalid_filter_returns_empty() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let filter = MetadataFilter::new().equals("", "x");
    let items = engine
        .retrieve_topk(refund_request(2).with_metadata_filter(filter))
        .await;

    assert!(items.is_empty());
    assert_eq!(store.searches(), 0);
}

#[tokio::test]
async fn test_hnsw_failure_falls_back_to_ivfflat_once() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    store.fail_statements_containing("USING hnsw");
    let engine = engine(config(), &provider, &store).await;

    engine.retrieve_topk(refund_request(1)).await;
    engine
        .retrieve_topk(RetrievalRequest::new("7", "42").with_query("shipping").with_top_k(1))
        .await;

    assert_eq!(store.statements_containing("USING hnsw"), 1);
    assert_eq!(store.statements_containing("USING ivfflat"), 1);
    assert_eq!(store.statements_containing("ANALYZE"), 1);
    assert_eq!(store.statements_containing("SET ivfflat.probes = 10"), 2);
    assert_eq!(store.searches(), 2);

    let configuration = engine.configuration().await;
    assert_eq!(
        configuration.optimized_tables,
        vec![("tb_7_42".to_string(), rag_retrieval::IndexKind::IvfFlat)]
    );
}

#[tokio::test]
async fn test_wide_tables_use_sequential_scan() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table(
        "tb_7_42",
        FakeTable::new(3072).with_row("a", "wide", 0.2),
    );
    let mut config = config();
    config.embedding.model = LARGE_MODEL.to_string();
    let engine = engine(config, &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(1)).await;

    assert_eq!(ids(&items), vec!["a"]);
    assert_eq!(store.statements_containing("CREATE INDEX"), 0);
    assert_eq!(store.statements_containing("SET statement_timeout = 30000"), 1);
}

#[tokio::test]
async fn test_index_failures_do_not_abort_queries() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    store.fail_statements_containing("CREATE INDEX");
    store.fail_statements_containing("SET hnsw.ef_search");
    let engine = engine(config(), &provider, &store).await;

    let items = engine.retrieve_topk(refund_request(2)).await;

    assert_eq!(ids(&items), vec!["a", "b"]);
    assert_eq!(store.statements_containing("CREATE INDEX"), 2);
}

#[tokio::test]
async fn test_pool_exhaustion_fails_cleanly() {
    let provider = FakeProvider::new();
    let store = FakeStore::with_pool(single_connection_pool(50)).with_table("tb_7_42", refund_table());
    store.set_search_delay(Duration::from_millis(300));
    let engine = engine(config(), &provider, &store).await;

    let (first, second) = tokio::join!(
        engine.retrieve_topk(refund_request(2)),
        engine.retrieve_topk(
            RetrievalRequest::new("7", "42")
                .with_query("shipping")
                .with_top_k(2)
        ),
    );

    let served = [&first, &second].iter().filter(|items| !items.is_empty()).count();
    assert_eq!(served, 1, "exactly one caller holds the only connection");
    assert_eq!(engine.metrics().query_failures, 1);

    // The connection came back; nothing is stuck.
    let items = engine
        .retrieve_topk(RetrievalRequest::new("7", "42").with_query("returns").with_top_k(2))
        .await;
    assert_eq!(items.len(), 2);
    assert_eq!(store.connects(), 1);
}

#[tokio::test]
async fn test_waiting_caller_is_served_after_release() {
    let provider = FakeProvider::new();
    let store = FakeStore::with_pool(single_connection_pool(2000)).with_table("tb_7_42", refund_table());
    store.set_search_delay(Duration::from_millis(50));
    let engine = engine(config(), &provider, &store).await;

    let (first, second) = tokio::join!(
        engine.retrieve_topk(refund_request(2)),
        engine.retrieve_topk(
            RetrievalRequest::new("7", "42")
                .with_query("shipping")
                .with_top_k(2)
        ),
    );

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(store.connects(), 1);
}

#[tokio::test]
async fn test_index_builds_run_under_the_build_timeout() {
    let provider = FakeProvider::new();
    let store = FakeStore::with_pool(single_connection_pool(1000))
        .with_table("tb_7_42", refund_table())
        .with_table("tb_7_43", refund_table());
    let engine = engine(config(), &provider, &store).await;

    assert_eq!(ids(&engine.retrieve_topk(refund_request(1)).await), vec!["a"]);
    let items = engine
        .retrieve_topk(RetrievalRequest::new("7", "43").with_query("refund policy").with_top_k(1))
        .await;
    assert_eq!(ids(&items), vec!["a"]);

    // Both builds reuse the one connection that just served a search.
    let statements = store.statements();
    let mut builds = 0;
    for (i, statement) in statements.iter().enumerate() {
        if !statement.starts_with("CREATE INDEX") {
            continue;
        }
        builds += 1;
        let timeout = statements[..i]
            .iter()
            .rev()
            .find(|s| s.starts_with("SET statement_timeout"));
        assert_eq!(
            timeout.map(String::as_str),
            Some("SET statement_timeout = 300000"),
            "{statement}"
        );
    }
    assert_eq!(builds, 2);
    assert_eq!(store.connects(), 1);
}

#[tokio::test]
async fn test_batch_waits_for_connections_instead_of_failing() {
    let queries = ["refund policy", "shipping", "returns"];

    let mut outputs = Vec::new();
    for batch_size in [1, 3] {
        let provider = FakeProvider::new();
        let store = FakeStore::with_pool(single_connection_pool(50)).with_table("tb_7_42", refund_table());
        store.set_search_delay(Duration::from_millis(200));
        let engine = engine(config().with_batch_size(batch_size), &provider, &store).await;

        let results = engine
            .retrieve_topk_batch(BatchRetrievalRequest::new("7", "42", queries).with_top_k(2))
            .await;

        assert!(results.iter().all(|items| items.len() == 2), "batch_size {batch_size}");
        assert_eq!(engine.metrics().query_failures, 0);
        assert_eq!(store.connects(), 1);
        outputs.push(results);
    }

    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn test_batch_embeds_pending_queries_in_one_call() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let results = engine
        .retrieve_topk_batch(
            BatchRetrievalRequest::new("7", "42", ["refund policy", "shipping"]).with_top_k(1),
        )
        .await;

    assert_eq!(ids(&results[0]), vec!["a"]);
    assert_eq!(ids(&results[1]), vec!["a"]);
    assert_eq!(provider.batch_calls(), 1);
    assert_eq!(engine.metrics().embedding_calls, 2);
}

#[tokio::test]
async fn test_batch_cache_hits_record_latency() {
    let slow = Arc::new(SlowCache {
        inner: MemoryDistributedCache::new(),
        delay: Duration::from_millis(40),
    });

    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let writer = RetrievalEngine::builder(config())
        .with_embedding_provider(provider.clone())
        .with_vector_store(store.store())
        .with_distributed_cache(slow.clone())
        .build()
        .await
        .unwrap();
    writer.retrieve_topk(refund_request(2)).await;

    let reader = RetrievalEngine::builder(config())
        .with_embedding_provider(provider.clone())
        .with_vector_store(store.store())
        .with_distributed_cache(slow)
        .build()
        .await
        .unwrap();
    let results = reader
        .retrieve_topk_batch(
            BatchRetrievalRequest::new("user-7", "agent-42", ["refund policy"]).with_top_k(2),
        )
        .await;

    assert_eq!(ids(&results[0]), vec!["a", "b"]);
    let metrics = reader.metrics();
    assert_eq!(metrics.distributed_cache_hits, 1);
    assert_eq!(metrics.queries, 1);
    assert!(metrics.total_latency_ms >= 40, "{metrics:?}");
    assert!(metrics.avg_latency_ms >= 40.0, "{metrics:?}");
    assert_eq!(store.searches(), 1);
}

#[tokio::test]
async fn test_batch_preserves_order_and_dedupes_embeddings() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    // Warm the cache for one query.
    engine.retrieve_topk(refund_request(2)).await;
    assert_eq!(provider.calls(), 1);

    let batch = BatchRetrievalRequest::new(
        "user-7",
        "agent-42",
        ["shipping", "refund policy", "shipping", "", "returns"],
    )
    .with_top_k(2);
    let results = engine.retrieve_topk_batch(batch).await;

    assert_eq!(results.len(), 5);
    assert_eq!(ids(&results[1]), vec!["a", "b"]);
    assert_eq!(results[0], results[2]);
    assert!(results[3].is_empty());
    assert_eq!(results[4].len(), 2);

    assert_eq!(provider.calls_for_text("refund policy"), 1);
    assert_eq!(provider.calls_for_text("shipping"), 1);
    assert_eq!(provider.calls_for_text("returns"), 1);
    assert_eq!(engine.metrics().batch_queries, 1);
}

#[tokio::test]
async fn test_batch_size_does_not_change_results() {
    let queries = ["refund policy", "shipping", "returns", "exchanges"];

    let mut outputs = Vec::new();
    for batch_size in [1, 3, 100] {
        let provider = FakeProvider::new();
        let store = FakeStore::new().with_table("tb_7_42", refund_table());
        let engine = engine(config().with_batch_size(batch_size), &provider, &store).await;
        outputs.push(
            engine
                .retrieve_topk_batch(BatchRetrievalRequest::new("7", "42", queries).with_top_k(2))
                .await,
        );
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[tokio::test]
async fn test_distributed_tier_is_shared_between_engines() {
    let shared = Arc::new(MemoryDistributedCache::new());

    let provider_a = FakeProvider::new();
    let store_a = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine_a = RetrievalEngine::builder(config())
        .with_embedding_provider(provider_a.clone())
        .with_vector_store(store_a.store())
        .with_distributed_cache(shared.clone())
        .build()
        .await
        .unwrap();

    let provider_b = FakeProvider::new();
    let store_b = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine_b = RetrievalEngine::builder(config())
        .with_embedding_provider(provider_b.clone())
        .with_vector_store(store_b.store())
        .with_distributed_cache(shared.clone())
        .build()
        .await
        .unwrap();

    let from_a = engine_a.retrieve_topk(refund_request(2)).await;
    let from_b = engine_b.retrieve_topk(refund_request(2)).await;

    assert_eq!(from_a, from_b);
    assert_eq!(provider_b.calls(), 0);
    assert_eq!(store_b.searches(), 0);
    assert_eq!(engine_b.metrics().distributed_cache_hits, 1);

    // Backfilled into the local tier.
    engine_b.retrieve_topk(refund_request(2)).await;
    assert_eq!(engine_b.metrics().local_cache_hits, 1);
}

#[tokio::test]
async fn test_embed_text_and_format_context() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    let vector = engine.embed_text("refund policy", None, None).await.unwrap();
    assert_eq!(vector.dimension(), 1536);
    assert_eq!(vector.model(), SMALL_MODEL);
    assert!(engine.embed_text("  ", None, None).await.is_none());

    let items = engine.retrieve_topk(refund_request(2)).await;
    let context = engine.format_context(&items);
    assert!(context.starts_with("Context from your knowledge base (most relevant first):\n"));
    assert!(context.contains("[1] Refunds are accepted within 30 days.\n[2] Keep the receipt"));
    assert!(context.ends_with("Use this context when answering. If irrelevant, ignore it."));
    assert_eq!(engine.format_context(&[]), "");
}

#[tokio::test]
async fn test_embed_text_with_explicit_model_never_falls_back() {
    let provider = FakeProvider::new();
    provider.fail_model(SMALL_MODEL);
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let engine = engine(config(), &provider, &store).await;

    assert!(engine.embed_text("refund policy", None, Some(SMALL_MODEL)).await.is_none());
    assert_eq!(provider.calls_for_model(LARGE_MODEL), 0);

    let vector = engine.embed_text("refund policy", None, Some(LARGE_MODEL)).await.unwrap();
    assert_eq!(vector.model(), LARGE_MODEL);
    assert_eq!(vector.dimension(), 3072);

    // Without a model the configured fallback still applies.
    let vector = engine.embed_text("shipping", None, None).await.unwrap();
    assert_eq!(vector.model(), LARGE_MODEL);
}

#[tokio::test]
async fn test_configuration_redacts_secrets_and_metrics_reset() {
    let provider = FakeProvider::new();
    let store = FakeStore::new().with_table("tb_7_42", refund_table());
    let mut config = config();
    config.knowledge_database_url = Some("postgres://app:hunter2@db:5432/knowledge".to_string());
    config.embedding.api_key = Some("sk-secret".to_string());
    let engine = engine(config, &provider, &store).await;

    engine.warm().await;
    engine.retrieve_topk(refund_request(2)).await;

    let configuration = engine.configuration().await;
    let rendered = serde_json::to_string(&configuration).unwrap();
    assert!(!rendered.contains("hunter2"));
    assert!(!rendered.contains("sk-secret"));
    assert_eq!(configuration.embedding_provider, "fake");
    assert_eq!(configuration.query_cache_entries, 1);
    let pool = configuration.pool.unwrap();
    assert_eq!(pool.mode, PoolMode::Pooled);
    assert_eq!(pool.max_connections, 4);
    assert_eq!(pool.idle, pool.size);

    assert_eq!(engine.metrics().queries, 1);
    engine.reset_metrics();
    assert_eq!(engine.metrics().queries, 0);
}
