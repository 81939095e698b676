//! SQL text for the pgvector store.
//!
//! Identifiers are always quoted and every value is bound as a parameter;
//! only integers produced by configuration are interpolated.

use crate::config::TableNaming;
use crate::filter::MetadataPredicate;
use crate::store::{SessionSettings, SimilarityQuery};

/// Schema holding the knowledge tables.
pub const KNOWLEDGE_SCHEMA: &str = "public";

/// Width of the `embedding` column; pgvector stores it as the type modifier.
///
/// Binds the schema as `$1` and the unquoted table name as `$2`.
pub const COLUMN_DIMENSION_SQL: &str = "SELECT a.atttypmod::int4 \
     FROM pg_attribute a \
     JOIN pg_class c ON c.oid = a.attrelid \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2 \
     AND a.attname = 'embedding' AND NOT a.attisdropped";

/// Planner estimate of the table's row count (-1 when never analyzed).
///
/// Same parameters as [`COLUMN_DIMENSION_SQL`].
pub const ESTIMATE_ROWS_SQL: &str = "SELECT c.reltuples::int8 \
     FROM pg_class c \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2";

/// A value bound to a positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

/// Derive the knowledge table for a user/agent pair from the digits of
/// their ids. Ids without any digit produce no table.
pub fn knowledge_table_name(user_id: &str, agent_id: &str, naming: TableNaming) -> Option<String> {
    let uid: String = user_id.chars().filter(char::is_ascii_digit).collect();
    let aid: String = agent_id.chars().filter(char::is_ascii_digit).collect();
    if uid.is_empty() || aid.is_empty() {
        return None;
    }
    Some(match naming {
        TableNaming::Joined => format!("tb_{uid}_{aid}"),
        TableNaming::Concatenated => format!("tb_{uid}{aid}"),
    })
}

/// Quote an identifier for PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `public."table"`
pub fn qualified_table(table: &str) -> String {
    format!("{KNOWLEDGE_SCHEMA}.{}", quote_ident(table))
}

/// pgvector text literal, e.g. `[0.1,0.2]`.
pub fn vector_literal(values: &[f32]) -> String {
    let parts: Vec<String> = values.iter().map(f32::to_string).collect();
    format!("[{}]", parts.join(","))
}

/// Top-k cosine-distance query with optional metadata predicates.
pub fn similarity_sql(query: &SimilarityQuery) -> (String, Vec<SqlParam>) {
    let mut params = vec![SqlParam::Text(vector_literal(&query.vector))];
    let mut predicates = Vec::new();

    for predicate in query.filter.iter().flat_map(|f| f.predicates.iter()) {
        match predicate {
            MetadataPredicate::Equals { field, value } => {
                params.push(SqlParam::Text(field.clone()));
                let field_idx = params.len();
                params.push(SqlParam::Text(value.clone()));
                let value_idx = params.len();
                predicates.push(format!("(metadata::jsonb ->> ${field_idx}) = ${value_idx}"));
            }
            MetadataPredicate::Contains { document } => {
                params.push(SqlParam::Text(document.clone()));
                let idx = params.len();
                predicates.push(format!("metadata::jsonb @> ${idx}::jsonb"));
            }
        }
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!("WHERE {} ", predicates.join(" AND "))
    };

    params.push(SqlParam::Int(query.limit.max(1) as i64));
    let limit_idx = params.len();

    let sql = format!(
        "SELECT id::text AS id, text::text AS text, metadata::text AS metadata, \
         (embedding <=> $1::vector)::float8 AS distance \
         FROM {} {where_clause}\
         ORDER BY embedding <=> $1::vector \
         LIMIT ${limit_idx}",
        qualified_table(&query.table)
    );
    (sql, params)
}

/// `SET` statements for a session, in application order.
pub fn session_settings_sql(settings: &SessionSettings) -> Vec<String> {
    let mut statements = vec![format!(
        "SET statement_timeout = {}",
        settings.statement_timeout_ms
    )];
    if let Some(probes) = settings.ivfflat_probes {
        statements.push(format!("SET ivfflat.probes = {probes}"));
    }
    if let Some(ef_search) = settings.hnsw_ef_search {
        statements.push(format!("SET hnsw.ef_search = {ef_search}"));
    }
    statements
}

pub fn create_hnsw_index_sql(table: &str, m: u32, ef_construction: u32) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw (embedding vector_cosine_ops) \
         WITH (m = {m}, ef_construction = {ef_construction})",
        quote_ident(&format!("{table}_embedding_hnsw_idx")),
        qualified_table(table)
    )
}

pub fn create_ivfflat_index_sql(table: &str, lists: u32) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING ivfflat (embedding vector_cosine_ops) \
         WITH (lists = {lists})",
        quote_ident(&format!("{table}_embedding_ivfflat_idx")),
        qualified_table(table)
    )
}

pub fn analyze_sql(table: &str) -> String {
    format!("ANALYZE {}", qualified_table(table))
}

pub fn count_rows_sql(table: &str) -> String {
    format!("SELECT count(*)::int8 FROM {}", qualified_table(table))
}
