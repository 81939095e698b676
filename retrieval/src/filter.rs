//! Structured metadata filters for similarity queries.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// One predicate over the `metadata` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataPredicate {
    /// `metadata ->> field = value`
    Equals { field: String, value: String },

    /// `metadata @> document`
    Contains { document: String },
}

/// Conjunction of metadata predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub predicates: Vec<MetadataPredicate>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `metadata ->> field` to equal `value`.
    pub fn equals(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates.push(MetadataPredicate::Equals {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Require `metadata` to contain the given JSON document.
    pub fn contains(mut self, document: &serde_json::Value) -> Self {
        self.predicates.push(MetadataPredicate::Contains {
            document: document.to_string(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Reject predicates that cannot be translated.
    pub fn validate(&self) -> Result<()> {
        for predicate in &self.predicates {
            match predicate {
                MetadataPredicate::Equals { field, .. } if field.trim().is_empty() => {
                    return Err(RetrievalError::InvalidFilter(
                        "equality predicate with empty field".to_string(),
                    ));
                }
                MetadataPredicate::Contains { document } => {
                    let parsed: serde_json::Value = serde_json::from_str(document)
                        .map_err(|e| RetrievalError::InvalidFilter(e.to_string()))?;
                    if !parsed.is_object() && !parsed.is_array() {
                        return Err(RetrievalError::InvalidFilter(
                            "containment document must be an object or array".to_string(),
                        ));
                    }
                }
                MetadataPredicate::Equals { .. } => {}
            }
        }
        Ok(())
    }

    /// Stable textual form, used in cache keys.
    pub fn cache_fragment(&self) -> String {
        serde_json::to_string(&self.predicates).unwrap_or_default()
    }
}
