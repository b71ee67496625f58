//! The query engine: parse a dialect string, dispatch to the SQL functions.
//!
//! SEARCH queries auto-embed the query text through a [`QueryEmbedder`] —
//! a narrow seam so the store does not depend on any provider crate.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::dialect::{RemQuery, parse_query, validate_sql};
use crate::pool::Db;
use crate::registry::spec_for;
use crate::{Result, StoreError};

/// Embeds query text for SEARCH. Implemented by the embedding service.
#[async_trait]
pub trait QueryEmbedder: Send + Sync {
    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    fn provider_name(&self) -> &str;
}

pub struct RemQueryEngine<E> {
    db: Db,
    embedder: E,
    default_search_table: String,
}

impl<E: QueryEmbedder> RemQueryEngine<E> {
    pub fn new(db: Db, embedder: E) -> Self {
        Self {
            db,
            embedder,
            default_search_table: "schemas".to_string(),
        }
    }

    /// Parse and execute a dialect query under the given scope.
    pub async fn execute(
        &self,
        query_string: &str,
        tenant_id: Option<&str>,
        user_id: Option<Uuid>,
    ) -> Result<Vec<Value>> {
        let parsed = parse_query(query_string)?;
        debug!(?parsed, "dialect query parsed");
        self.dispatch(parsed, tenant_id, user_id).await
    }

    pub async fn dispatch(
        &self,
        query: RemQuery,
        tenant_id: Option<&str>,
        user_id: Option<Uuid>,
    ) -> Result<Vec<Value>> {
        match query {
            RemQuery::Lookup { keys } => {
                let mut results = Vec::new();
                for key in keys {
                    let hits = self.db.rem_lookup(&key, tenant_id, user_id).await?;
                    results.extend(hits.iter().map(|h| h.to_value()));
                }
                Ok(results)
            }

            RemQuery::Fuzzy { query_text, threshold, limit } => {
                self.db
                    .rem_fuzzy(&query_text, tenant_id, user_id, threshold, limit)
                    .await
            }

            RemQuery::Search { query_text, table, field, limit, min_similarity } => {
                let table = table.unwrap_or_else(|| self.default_search_table.clone());
                let spec = spec_for(&table)
                    .ok_or_else(|| StoreError::UnknownTable(table.clone()))?;
                let field = match field {
                    Some(field) => field,
                    None => spec
                        .embedding_field
                        .ok_or_else(|| {
                            StoreError::Invalid(format!("table {table} is not embeddable"))
                        })?
                        .to_string(),
                };

                let embedding = self
                    .embedder
                    .embed_query(&query_text)
                    .await
                    .map_err(|e| StoreError::Invalid(format!("query embedding failed: {e}")))?;

                self.db
                    .rem_search(
                        &embedding,
                        &table,
                        &field,
                        tenant_id,
                        self.embedder.provider_name(),
                        min_similarity,
                        limit,
                        user_id,
                    )
                    .await
            }

            RemQuery::Traverse { start_key, max_depth, rel_type } => {
                self.db
                    .rem_traverse(&start_key, tenant_id, user_id, max_depth, rel_type.as_deref())
                    .await
            }

            RemQuery::Sql { sql } => {
                validate_sql(&sql)?;
                self.db.fetch_raw_json(&sql).await
            }
        }
    }
}
