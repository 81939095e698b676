//! PostgreSQL/pgvector implementation of the store seams.
//!
//! Connections come from a sqlx [`PgPool`]. When the pool cannot be built
//! (database down at startup, invalid bounds) the store serves requests from
//! one lazily opened connection and tries to build the pool again at most
//! once per [`POOL_RETRY_INTERVAL`].

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, Postgres, Row};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{PoolSettings, describe_url};
use crate::error::{Result, RetrievalError};
use crate::sql::{self, KNOWLEDGE_SCHEMA, SqlParam};
use crate::store::{
    PoolMode, PoolStats, ScoredRow, SessionSettings, SimilarityQuery, VectorConnection,
    VectorStore,
};

/// Largest cosine distance; used when a row has no embedding.
const MAX_COSINE_DISTANCE: f64 = 2.0;

/// Minimum time between attempts to build the pool while in single mode.
pub const POOL_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// The knowledge database behind a sqlx pool.
pub struct PgVectorStore {
    options: PgConnectOptions,
    settings: PoolSettings,
    target: String,
    pool: OnceCell<PgPool>,
    single: Arc<AsyncMutex<Option<PgConnection>>>,
    retry: PoolRetry,
}

impl PgVectorStore {
    /// Parse `database_url` and build the pool.
    ///
    /// Fails only on a malformed URL. An unreachable database leaves the store
    /// in single-connection mode.
    pub async fn connect(database_url: &str, settings: PoolSettings) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)?.application_name("rag-retrieval");
        let store = Self {
            options,
            settings,
            target: describe_url(database_url),
            pool: OnceCell::new(),
            single: Arc::new(AsyncMutex::new(None)),
            retry: PoolRetry::new(POOL_RETRY_INTERVAL),
        };
        if let Err(e) = store.try_pool().await {
            warn!(
                "Connection pool for {} unavailable ({e}); using a single reused connection",
                store.target
            );
        }
        Ok(store)
    }

    /// The pool, building it when no attempt was made within the retry
    /// interval.
    async fn try_pool(&self) -> Result<&PgPool> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        if !self.retry.claim() {
            return Err(RetrievalError::StoreUnavailable(
                "connection pool not built yet".to_string(),
            ));
        }
        self.pool.get_or_try_init(|| self.build_pool()).await
    }

    async fn build_pool(&self) -> Result<PgPool> {
        let s = &self.settings;
        if s.max_connections == 0 || s.min_connections > s.max_connections {
            return Err(RetrievalError::Config(format!(
                "invalid pool bounds (min: {}, max: {})",
                s.min_connections, s.max_connections
            )));
        }

        let pool = PgPoolOptions::new()
            .min_connections(u32::try_from(s.min_connections).unwrap_or(u32::MAX))
            .max_connections(u32::try_from(s.max_connections).unwrap_or(u32::MAX))
            .acquire_timeout(s.acquire_timeout())
            .test_before_acquire(true)
            .connect_with(self.options.clone())
            .await?;

        info!(
            "Connection pool ready for {} (min: {}, max: {})",
            self.target, s.min_connections, s.max_connections
        );
        if let Ok(mut slot) = self.single.try_lock() {
            slot.take();
        }
        Ok(pool)
    }

    async fn acquire_pooled(&self, pool: &PgPool) -> Result<Box<dyn VectorConnection>> {
        let start = Instant::now();
        match pool.acquire().await {
            Ok(conn) => Ok(Box::new(PgVectorConnection::new(Handle::Pooled(conn)))),
            Err(sqlx::Error::PoolTimedOut) => {
                let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!("Connection pool exhausted after {waited_ms}ms");
                Err(RetrievalError::PoolExhausted { waited_ms })
            }
            Err(e) => Err(RetrievalError::from_driver(e)),
        }
    }

    async fn acquire_single(&self) -> Result<Box<dyn VectorConnection>> {
        let start = Instant::now();
        let mut slot =
            match tokio::time::timeout(self.settings.acquire_timeout(), self.single.clone().lock_owned())
                .await
            {
                Ok(slot) => slot,
                Err(_) => {
                    let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    return Err(RetrievalError::PoolExhausted { waited_ms });
                }
            };

        let alive = match slot.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };
        if !alive {
            if slot.is_some() {
                debug!("Single connection to {} closed; reopening", self.target);
            }
            *slot = Some(self.open_single().await?);
        }
        Ok(Box::new(PgVectorConnection::new(Handle::Single(slot))))
    }

    async fn open_single(&self) -> Result<PgConnection> {
        let timeout = self.settings.connect_timeout();
        match tokio::time::timeout(timeout, PgConnection::connect_with(&self.options)).await {
            Ok(Ok(conn)) => {
                debug!("Opened single connection to {}", self.target);
                Ok(conn)
            }
            Ok(Err(e)) => Err(RetrievalError::from_driver(e)),
            Err(_) => Err(RetrievalError::StoreUnavailable(format!(
                "connecting to {} timed out after {}ms",
                self.target,
                timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn acquire(&self) -> Result<Box<dyn VectorConnection>> {
        match self.try_pool().await {
            Ok(pool) => self.acquire_pooled(pool).await,
            Err(e) => {
                debug!("Serving from the single connection: {e}");
                self.acquire_single().await
            }
        }
    }

    fn max_connections(&self) -> usize {
        match self.pool.get() {
            Some(_) => self.settings.max_connections,
            None => 1,
        }
    }

    fn stats(&self) -> PoolStats {
        match self.pool.get() {
            Some(pool) => PoolStats {
                mode: PoolMode::Pooled,
                max_connections: self.settings.max_connections,
                size: usize::try_from(pool.size()).unwrap_or(usize::MAX),
                idle: pool.num_idle(),
            },
            None => {
                let (size, idle) = match self.single.try_lock() {
                    Ok(slot) => {
                        let open = usize::from(slot.is_some());
                        (open, open)
                    }
                    Err(_) => (1, 0),
                };
                PoolStats {
                    mode: PoolMode::Single,
                    max_connections: 1,
                    size,
                    idle,
                }
            }
        }
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

/// Rate limit for pool construction attempts.
#[derive(Debug)]
struct PoolRetry {
    next: Mutex<Option<Instant>>,
    interval: Duration,
}

impl PoolRetry {
    fn new(interval: Duration) -> Self {
        Self {
            next: Mutex::new(None),
            interval,
        }
    }

    /// Whether the caller may attempt now; a granted attempt pushes the next
    /// one out by the interval.
    fn claim(&self) -> bool {
        let now = Instant::now();
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        match *next {
            Some(at) if now < at => false,
            _ => {
                *next = Some(now + self.interval);
                true
            }
        }
    }
}

enum Handle {
    Pooled(PoolConnection<Postgres>),
    Single(OwnedMutexGuard<Option<PgConnection>>),
}

/// One PostgreSQL connection. Statements run outside explicit transactions.
///
/// Dropping it returns the connection to the pool, or closes it when a
/// statement failed at the transport level.
pub struct PgVectorConnection {
    handle: Option<Handle>,
    broken: bool,
}

impl PgVectorConnection {
    fn new(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
            broken: false,
        }
    }

    fn conn(&mut self) -> Result<&mut PgConnection> {
        match &mut self.handle {
            Some(Handle::Pooled(conn)) => Ok(&mut **conn),
            Some(Handle::Single(slot)) => slot
                .as_mut()
                .ok_or_else(|| RetrievalError::StoreUnavailable("connection released".to_string())),
            None => Err(RetrievalError::StoreUnavailable(
                "connection released".to_string(),
            )),
        }
    }

    fn track<T>(&mut self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|e| {
            let err = RetrievalError::from_driver(e);
            if err.poisons_connection() {
                self.broken = true;
            }
            err
        })
    }
}

impl Drop for PgVectorConnection {
    fn drop(&mut self) {
        if !self.broken {
            return;
        }
        match self.handle.take() {
            Some(Handle::Pooled(conn)) => {
                debug!("Closing broken pooled connection");
                drop(conn.detach());
            }
            Some(Handle::Single(mut slot)) => {
                debug!("Closing broken single connection");
                *slot = None;
            }
            None => {}
        }
    }
}

#[async_trait]
impl VectorConnection for PgVectorConnection {
    fn is_closed(&self) -> bool {
        self.broken
    }

    async fn ping(&mut self) -> Result<()> {
        let result = self.conn()?.ping().await;
        self.track(result)
    }

    async fn column_dimension(&mut self, table: &str) -> Result<Option<usize>> {
        let result = sqlx::query_scalar::<_, i32>(sql::COLUMN_DIMENSION_SQL)
            .bind(KNOWLEDGE_SCHEMA)
            .bind(table)
            .fetch_optional(self.conn()?)
            .await;
        // atttypmod is -1 for an unconstrained `vector` column.
        Ok(self
            .track(result)?
            .and_then(|typmod| usize::try_from(typmod).ok())
            .filter(|dimension| *dimension > 0))
    }

    async fn estimate_rows(&mut self, table: &str) -> Result<Option<u64>> {
        let result = sqlx::query_scalar::<_, i64>(sql::ESTIMATE_ROWS_SQL)
            .bind(KNOWLEDGE_SCHEMA)
            .bind(table)
            .fetch_optional(self.conn()?)
            .await;
        match self.track(result)? {
            None => Ok(None),
            Some(estimate) if estimate >= 0 => Ok(u64::try_from(estimate).ok()),
            Some(_) => {
                // Never analyzed; count instead.
                let statement = sql::count_rows_sql(table);
                let result = sqlx::query_scalar::<_, i64>(&statement)
                    .fetch_one(self.conn()?)
                    .await;
                Ok(u64::try_from(self.track(result)?).ok())
            }
        }
    }

    async fn execute(&mut self, statement: &str) -> Result<()> {
        let result = sqlx::query(statement).execute(self.conn()?).await;
        self.track(result).map(|_| ())
    }

    async fn apply_settings(&mut self, settings: &SessionSettings) -> Result<()> {
        for statement in sql::session_settings_sql(settings) {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    async fn similarity_search(&mut self, query: &SimilarityQuery) -> Result<Vec<ScoredRow>> {
        let (statement, params) = sql::similarity_sql(query);
        let mut prepared = sqlx::query(&statement);
        for param in params {
            prepared = match param {
                SqlParam::Text(value) => prepared.bind(value),
                SqlParam::Int(value) => prepared.bind(value),
            };
        }
        let result = prepared.fetch_all(self.conn()?).await;
        let rows = self.track(result)?;
        rows.iter().map(scored_row).collect()
    }
}

fn scored_row(row: &PgRow) -> Result<ScoredRow> {
    let id: Option<String> = row.try_get("id")?;
    let text: Option<String> = row.try_get("text")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let distance: Option<f64> = row.try_get("distance")?;
    Ok(ScoredRow {
        id: id.unwrap_or_default(),
        text,
        metadata: metadata.map(|raw| {
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
        }),
        distance: distance.unwrap_or(MAX_COSINE_DISTANCE),
    })
}
