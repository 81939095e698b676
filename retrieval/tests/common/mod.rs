//! In-memory fakes of the embedding provider and the vector store.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use rag_embeddings::{EmbeddingError, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse};
use rag_retrieval::sql::session_settings_sql;
use rag_retrieval::{
    MetadataPredicate, PoolMode, PoolSettings, PoolStats, RagConfig, Result, RetrievalError,
    ScoredRow, SessionSettings, SimilarityQuery, VectorConnection, VectorStore,
};

pub const SMALL_MODEL: &str = "text-embedding-3-small";
pub const LARGE_MODEL: &str = "text-embedding-3-large";

/// Engine configuration pointing at the fakes, with `SMALL_MODEL` as primary.
pub fn config() -> RagConfig {
    let mut config = RagConfig::new("postgres://fake:5432/knowledge");
    config.embedding.model = SMALL_MODEL.to_string();
    config.embedding.fallback_model = Some(LARGE_MODEL.to_string());
    config.embedding.max_retries = 1;
    config.embedding.retry_backoff_ms = 0;
    config.pool = PoolSettings {
        min_connections: 0,
        max_connections: 4,
        acquire_timeout_ms: 1000,
        connect_timeout_ms: 100,
    };
    config
}

/// Embedding provider producing constant vectors of each model's width.
pub struct FakeProvider {
    widths: HashMap<String, usize>,
    calls: Mutex<Vec<(String, String)>>,
    batch_calls: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            widths: HashMap::from([
                (SMALL_MODEL.to_string(), 1536),
                (LARGE_MODEL.to_string(), 3072),
            ]),
            calls: Mutex::new(Vec::new()),
            batch_calls: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_model(&self, model: &str) {
        self.failing.lock().unwrap().insert(model.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for_model(&self, model: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == model)
            .count()
    }

    pub fn calls_for_text(&self, text: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t == text)
            .count()
    }
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn default_model(&self) -> &str {
        SMALL_MODEL
    }

    async fn embed(&self, request: EmbeddingRequest) -> rag_embeddings::Result<EmbeddingResponse> {
        let model = request.model.unwrap_or_else(|| SMALL_MODEL.to_string());
        self.calls
            .lock()
            .unwrap()
            .push((model.clone(), request.text.clone()));

        if self.failing.lock().unwrap().contains(&model) {
            return Err(EmbeddingError::ApiRequest {
                status: 400,
                message: format!("model {model} unavailable"),
            });
        }
        let dimension = *self
            .widths
            .get(&model)
            .ok_or_else(|| EmbeddingError::InvalidResponse(format!("unknown model {model}")))?;
        Ok(EmbeddingResponse {
            embedding: vec![0.1; dimension],
            model,
            dimension,
            tokens_used: None,
        })
    }

    async fn embed_batch(
        &self,
        requests: Vec<EmbeddingRequest>,
    ) -> rag_embeddings::Result<Vec<EmbeddingResponse>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.embed(request).await?);
        }
        Ok(responses)
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// One knowledge table.
#[derive(Debug, Clone)]
pub struct FakeTable {
    pub dimension: usize,
    pub rows: Vec<ScoredRow>,
    /// Widths reported by successive catalog probes before `dimension`.
    pub reported: Vec<usize>,
}

impl FakeTable {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rows: Vec::new(),
            reported: Vec::new(),
        }
    }

    pub fn with_row(mut self, id: &str, text: &str, distance: f64) -> Self {
        self.rows.push(ScoredRow {
            id: id.to_string(),
            text: Some(text.to_string()),
            metadata: Some(serde_json::json!({ "source": "handbook", "id": id })),
            distance,
        });
        self
    }

    pub fn with_metadata_row(mut self, id: &str, metadata: serde_json::Value, distance: f64) -> Self {
        self.rows.push(ScoredRow {
            id: id.to_string(),
            text: Some(format!("passage {id}")),
            metadata: Some(metadata),
            distance,
        });
        self
    }

    /// Report `width` on the first catalog probe, the real width afterwards.
    pub fn reporting_first(mut self, width: usize) -> Self {
        self.reported.push(width);
        self
    }
}

pub struct StoreState {
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    idle: AtomicUsize,
    tables: Mutex<HashMap<String, FakeTable>>,
    statements: Mutex<Vec<String>>,
    failing_statements: Mutex<Vec<String>>,
    search_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    probes: AtomicUsize,
    searches: AtomicUsize,
}

/// In-memory vector store that counts every interaction.
#[derive(Clone)]
pub struct FakeStore {
    state: Arc<StoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::with_pool(PoolSettings {
            min_connections: 0,
            max_connections: 4,
            acquire_timeout_ms: 1000,
            connect_timeout_ms: 100,
        })
    }

    /// A store holding at most `settings.max_connections` connections.
    pub fn with_pool(settings: PoolSettings) -> Self {
        Self {
            state: Arc::new(StoreState {
                permits: Arc::new(Semaphore::new(settings.max_connections)),
                settings,
                idle: AtomicUsize::new(0),
                tables: Mutex::default(),
                statements: Mutex::default(),
                failing_statements: Mutex::default(),
                search_delay: Mutex::default(),
                connects: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                searches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_table(self, name: &str, table: FakeTable) -> Self {
        self.state
            .tables
            .lock()
            .unwrap()
            .insert(name.to_string(), table);
        self
    }

    /// Make statements containing `fragment` fail.
    pub fn fail_statements_containing(&self, fragment: &str) {
        self.state
            .failing_statements
            .lock()
            .unwrap()
            .push(fragment.to_string());
    }

    pub fn set_search_delay(&self, delay: Duration) {
        *self.state.search_delay.lock().unwrap() = Some(delay);
    }

    pub fn store(&self) -> Arc<dyn VectorStore> {
        Arc::new(self.clone())
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.state.searches.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().unwrap().clone()
    }

    pub fn statements_containing(&self, fragment: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.contains(fragment))
            .count()
    }
}

#[async_trait]
impl VectorStore for FakeStore {
    async fn acquire(&self) -> Result<Box<dyn VectorConnection>> {
        let timeout = self.state.settings.acquire_timeout();
        let permits = self.state.permits.clone();
        let permit = match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                return Err(RetrievalError::PoolExhausted {
                    waited_ms: self.state.settings.acquire_timeout_ms,
                });
            }
        };
        let reused = self
            .state
            .idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |idle| idle.checked_sub(1))
            .is_ok();
        if !reused {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
            _permit: permit,
        }))
    }

    fn max_connections(&self) -> usize {
        self.state.settings.max_connections
    }

    fn stats(&self) -> PoolStats {
        let idle = self.state.idle.load(Ordering::SeqCst);
        let leased = self.state.settings.max_connections - self.state.permits.available_permits();
        PoolStats {
            mode: PoolMode::Pooled,
            max_connections: self.state.settings.max_connections,
            size: idle + leased,
            idle,
        }
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FakeConnection {
    state: Arc<StoreState>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.state.idle.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeConnection {
    fn record(&self, statement: &str) -> Result<()> {
        self.state
            .statements
            .lock()
            .unwrap()
            .push(statement.to_string());
        let failing = self.state.failing_statements.lock().unwrap();
        match failing.iter().find(|fragment| statement.contains(fragment.as_str())) {
            Some(fragment) => Err(RetrievalError::Query(format!(
                "statement rejected ({fragment})"
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VectorConnection for FakeConnection {
    fn is_closed(&self) -> bool {
        false
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn column_dimension(&mut self, table: &str) -> Result<Option<usize>> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.state.tables.lock().unwrap();
        Ok(tables.get_mut(table).map(|t| {
            if t.reported.is_empty() {
                t.dimension
            } else {
                t.reported.remove(0)
            }
        }))
    }

    async fn estimate_rows(&mut self, table: &str) -> Result<Option<u64>> {
        let tables = self.state.tables.lock().unwrap();
        Ok(tables.get(table).map(|t| t.rows.len() as u64))
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.record(sql)
    }

    async fn apply_settings(&mut self, settings: &SessionSettings) -> Result<()> {
        for statement in session_settings_sql(settings) {
            self.record(&statement)?;
        }
        Ok(())
    }

    async fn similarity_search(&mut self, query: &SimilarityQuery) -> Result<Vec<ScoredRow>> {
        self.state.searches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.search_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let table = self
            .state
            .tables
            .lock()
            .unwrap()
            .get(&query.table)
            .cloned()
            .ok_or_else(|| {
                RetrievalError::Query(format!("relation \"{}\" does not exist", query.table))
            })?;
        if table.dimension != query.vector.len() {
            return Err(RetrievalError::Query(format!(
                "error returned from database: different vector dimensions {} and {}",
                table.dimension,
                query.vector.len()
            )));
        }

        let mut rows: Vec<ScoredRow> = table
            .rows
            .into_iter()
            .filter(|row| matches_filter(row, query))
            .collect();
        rows.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        rows.truncate(query.limit);
        Ok(rows)
    }
}

fn matches_filter(row: &ScoredRow, query: &SimilarityQuery) -> bool {
    let Some(filter) = &query.filter else {
        return true;
    };
    let metadata = row.metadata.clone().unwrap_or(serde_json::Value::Null);
    filter.predicates.iter().all(|predicate| match predicate {
        MetadataPredicate::Equals { field, value } => {
            metadata.get(field).and_then(|v| v.as_str()) == Some(value.as_str())
        }
        MetadataPredicate::Contains { document } => {
            let expected: serde_json::Value = serde_json::from_str(document).unwrap();
            expected
                .as_object()
                .map(|fields| fields.iter().all(|(k, v)| metadata.get(k) == Some(v)))
                .unwrap_or(false)
        }
    })
}

/// Equality within float noise.
pub fn approx_eq(actual: &[f64], expected: &[f64]) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| (a - e).abs() < 1e-9)
}
