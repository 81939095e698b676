//! ANN index provisioning and search parameters.
//!
//! Provisioning runs once per table: the policy yields an ordered list of
//! strategies and the first one that succeeds is remembered. Index DDL runs
//! under its own statement timeout, never one left over from a search. Search
//! parameters are derived from the remembered kind and the table's
//! estimated size.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::IndexSettings;
use crate::error::Result;
use crate::sql;
use crate::store::{SessionSettings, VectorConnection, VectorStore};

/// Row counts at which IVFFLAT probes are scaled up.
const MEDIUM_TABLE_ROWS: u64 = 10_000;
const LARGE_TABLE_ROWS: u64 = 100_000;
const HUGE_TABLE_ROWS: u64 = 1_000_000;

/// How similarity queries against a table are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Hnsw,
    IvfFlat,
    Sequential,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hnsw => write!(f, "hnsw"),
            Self::IvfFlat => write!(f, "ivfflat"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// One provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStrategy {
    CreateHnsw,
    CreateIvfFlat,
    SequentialScan,
}

impl IndexStrategy {
    pub fn kind(self) -> IndexKind {
        match self {
            Self::CreateHnsw => IndexKind::Hnsw,
            Self::CreateIvfFlat => IndexKind::IvfFlat,
            Self::SequentialScan => IndexKind::Sequential,
        }
    }

    /// Issue this step's DDL, if any.
    pub async fn attempt(
        self,
        conn: &mut dyn VectorConnection,
        table: &str,
        settings: &IndexSettings,
    ) -> Result<IndexKind> {
        let ddl = match self {
            Self::CreateHnsw => {
                sql::create_hnsw_index_sql(table, settings.hnsw_m, settings.hnsw_ef_construction)
            }
            Self::CreateIvfFlat => sql::create_ivfflat_index_sql(table, settings.ivfflat_lists),
            Self::SequentialScan => return Ok(IndexKind::Sequential),
        };
        conn.execute(&ddl).await?;
        Ok(self.kind())
    }
}

/// Session parameters for one similarity query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub kind: IndexKind,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Copy)]
struct TableIndexState {
    kind: IndexKind,
    estimated_rows: Option<u64>,
}

/// Per-table index state, shared by all retrievals.
pub struct IndexManager {
    settings: IndexSettings,
    states: Mutex<HashMap<String, Arc<OnceCell<TableIndexState>>>>,
}

impl IndexManager {
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Ordered strategies for a column of `dimension` width.
    pub fn plan(&self, dimension: Option<usize>) -> Vec<IndexStrategy> {
        let s = &self.settings;
        match dimension {
            Some(dim) if dim > s.ann_dimension_limit => vec![IndexStrategy::SequentialScan],
            Some(dim) if s.hnsw_enabled && dim >= s.hnsw_min_dimension => vec![
                IndexStrategy::CreateHnsw,
                IndexStrategy::CreateIvfFlat,
                IndexStrategy::SequentialScan,
            ],
            _ => vec![IndexStrategy::CreateIvfFlat, IndexStrategy::SequentialScan],
        }
    }

    /// Provision an index for `table` on first use and return its kind.
    ///
    /// Never fails: when no connection can be acquired the table is served by a
    /// sequential scan this time and provisioning is retried on the next call.
    pub async fn ensure_index(
        &self,
        table: &str,
        dimension: Option<usize>,
        store: &dyn VectorStore,
    ) -> IndexKind {
        let cell = self.cell(table);
        match cell
            .get_or_try_init(|| self.provision(table, dimension, store))
            .await
        {
            Ok(state) => state.kind,
            Err(e) => {
                warn!(table = %table, "Index provisioning deferred: {e}");
                IndexKind::Sequential
            }
        }
    }

    /// Estimated row count remembered at provisioning time.
    pub fn estimated_rows(&self, table: &str) -> Option<u64> {
        self.state(table).and_then(|state| state.estimated_rows)
    }

    /// Tables provisioned so far.
    pub fn optimized_tables(&self) -> Vec<(String, IndexKind)> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tables: Vec<(String, IndexKind)> = states
            .iter()
            .filter_map(|(table, cell)| cell.get().map(|state| (table.clone(), state.kind)))
            .collect();
        tables.sort();
        tables
    }

    /// Session settings for a query served by `kind`.
    pub fn search_params(&self, kind: IndexKind, estimated_rows: Option<u64>) -> SearchParams {
        let s = &self.settings;
        let huge = estimated_rows.is_some_and(|rows| rows >= HUGE_TABLE_ROWS);

        let settings = match kind {
            IndexKind::Hnsw => SessionSettings {
                statement_timeout_ms: s.statement_timeout_ms,
                ivfflat_probes: None,
                hnsw_ef_search: Some(s.hnsw_ef_search),
            },
            IndexKind::IvfFlat => SessionSettings {
                statement_timeout_ms: if huge {
                    s.full_scan_timeout_ms
                } else {
                    s.statement_timeout_ms
                },
                ivfflat_probes: Some(self.probes_for(estimated_rows)),
                hnsw_ef_search: None,
            },
            IndexKind::Sequential => SessionSettings {
                statement_timeout_ms: s.full_scan_timeout_ms,
                ivfflat_probes: None,
                hnsw_ef_search: None,
            },
        };
        SearchParams { kind, settings }
    }

    /// Session settings for index DDL and the ANALYZE that follows it.
    pub fn build_settings(&self) -> SessionSettings {
        SessionSettings {
            statement_timeout_ms: self.settings.index_build_timeout_ms,
            ivfflat_probes: None,
            hnsw_ef_search: None,
        }
    }

    /// IVFFLAT probes scaled by table size, capped at the configured maximum.
    pub fn probes_for(&self, estimated_rows: Option<u64>) -> u32 {
        let factor = match estimated_rows.unwrap_or(0) {
            rows if rows < MEDIUM_TABLE_ROWS => 1,
            rows if rows < LARGE_TABLE_ROWS => 2,
            rows if rows < HUGE_TABLE_ROWS => 4,
            _ => 8,
        };
        self.settings
            .ivfflat_probes
            .saturating_mul(factor)
            .min(self.settings.ivfflat_max_probes)
    }

    async fn provision(
        &self,
        table: &str,
        dimension: Option<usize>,
        store: &dyn VectorStore,
    ) -> Result<TableIndexState> {
        let mut conn = store.acquire().await?;

        let plan = self.plan(dimension);
        if plan.iter().any(|strategy| strategy.kind() != IndexKind::Sequential) {
            if let Err(e) = conn.apply_settings(&self.build_settings()).await {
                warn!(table = %table, "Setting the index build timeout failed: {e}");
            }
        }

        let mut kind = IndexKind::Sequential;
        for strategy in plan {
            match strategy.attempt(conn.as_mut(), table, &self.settings).await {
                Ok(chosen) => {
                    kind = chosen;
                    break;
                }
                Err(e) => {
                    warn!(table = %table, "Creating {} index failed: {e}", strategy.kind());
                }
            }
        }

        if kind != IndexKind::Sequential {
            if let Err(e) = conn.execute(&sql::analyze_sql(table)).await {
                debug!(table = %table, "ANALYZE after index creation failed: {e}");
            }
        }

        let estimated_rows = match conn.estimate_rows(table).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(table = %table, "Row estimate failed: {e}");
                None
            }
        };

        info!(
            table = %table,
            dimension = ?dimension,
            estimated_rows = ?estimated_rows,
            "Knowledge table served by {kind}"
        );
        Ok(TableIndexState {
            kind,
            estimated_rows,
        })
    }

    fn cell(&self, table: &str) -> Arc<OnceCell<TableIndexState>> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_string())
            .or_default()
            .clone()
    }

    fn state(&self, table: &str) -> Option<TableIndexState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .and_then(|cell| cell.get().copied())
    }
}
