//! Knowledge table vector widths.
//!
//! Each table is probed at most once per process through the catalog; a
//! probe that fails is remembered as unknown. Only a query-time mismatch
//! triggers [`TableDimensionResolver::refresh`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::ModelDimension;
use crate::error::Result;
use crate::store::VectorStore;

type DimensionCell = Arc<OnceCell<Option<usize>>>;

/// Resolves and remembers the width of each table's `embedding` column.
pub struct TableDimensionResolver {
    records: Mutex<HashMap<String, DimensionCell>>,
    hints: Vec<ModelDimension>,
}

impl TableDimensionResolver {
    pub fn new(hints: Vec<ModelDimension>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            hints,
        }
    }

    /// Width of `table`'s embedding column, `None` when it cannot be read.
    ///
    /// Errors only when no connection could be acquired; that outcome is not
    /// remembered.
    pub async fn dimension_of(&self, table: &str, store: &dyn VectorStore) -> Result<Option<usize>> {
        let cell = self.cell(table);
        cell.get_or_try_init(|| probe(table, store)).await.copied()
    }

    /// Forget the remembered width and probe again.
    pub async fn refresh(&self, table: &str, store: &dyn VectorStore) -> Result<Option<usize>> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table);
        self.dimension_of(table, store).await
    }

    /// A model producing `dimension`-wide vectors; `preferred` wins when it
    /// qualifies.
    pub fn model_for_dimension(&self, dimension: usize, preferred: Option<&str>) -> Option<String> {
        let matching = |hint: &&ModelDimension| hint.dimension == dimension;
        preferred
            .and_then(|model| {
                self.hints
                    .iter()
                    .filter(matching)
                    .find(|hint| hint.model == model)
            })
            .or_else(|| self.hints.iter().find(matching))
            .map(|hint| hint.model.clone())
    }

    fn cell(&self, table: &str) -> DimensionCell {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_string())
            .or_default()
            .clone()
    }
}

async fn probe(table: &str, store: &dyn VectorStore) -> Result<Option<usize>> {
    let mut conn = store.acquire().await?;
    let result = conn.column_dimension(table).await;
    match result {
        Ok(Some(dimension)) => {
            debug!(table = %table, "Resolved embedding dimension {dimension}");
            Ok(Some(dimension))
        }
        Ok(None) => {
            warn!(table = %table, "Embedding dimension unknown (missing table or untyped column)");
            Ok(None)
        }
        Err(e) => {
            warn!(table = %table, "Failed to resolve embedding dimension: {e}");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolver() -> TableDimensionResolver {
        TableDimensionResolver::new(vec![
            ModelDimension::new("text-embedding-3-large", 3072),
            ModelDimension::new("text-embedding-3-small", 1536),
            ModelDimension::new("text-embedding-ada-002", 1536),
        ])
    }

    #[test]
    fn test_model_for_dimension() {
        let resolver = resolver();
        assert_eq!(
            resolver.model_for_dimension(3072, None).as_deref(),
            Some("text-embedding-3-large")
        );
        assert_eq!(
            resolver.model_for_dimension(1536, None).as_deref(),
            Some("text-embedding-3-small")
        );
        assert_eq!(
            resolver
                .model_for_dimension(1536, Some("text-embedding-ada-002"))
                .as_deref(),
            Some("text-embedding-ada-002")
        );
        // A preferred model with the wrong width is ignored.
        assert_eq!(
            resolver
                .model_for_dimension(1536, Some("text-embedding-3-large"))
                .as_deref(),
            Some("text-embedding-3-small")
        );
        assert_eq!(resolver.model_for_dimension(768, None), None);
    }
}
