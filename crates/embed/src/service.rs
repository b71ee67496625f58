//! Queue draining: claim, extract, dedupe, embed, store.

use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::Row;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use p8_crypto::{EncryptionService, content_hash, try_decrypt_value};
use p8_store::engine::QueryEmbedder;
use p8_store::registry::{embeddable_tables, spec_for};
use p8_store::Db;

use crate::EmbeddingProvider;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct QueueItem {
    table_name: String,
    entity_id: Uuid,
    field_name: String,
}

pub struct EmbeddingService {
    db: Db,
    provider: Arc<dyn EmbeddingProvider>,
    encryption: Arc<EncryptionService>,
    batch_size: i64,
}

impl EmbeddingService {
    pub fn new(
        db: Db,
        provider: Arc<dyn EmbeddingProvider>,
        encryption: Arc<EncryptionService>,
        batch_size: i64,
    ) -> Self {
        Self { db, provider, encryption, batch_size }
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.provider)
    }

    /// Claim and process one batch from the embedding queue.
    pub async fn process_batch(&self) -> anyhow::Result<BatchSummary> {
        let batch = self.claim_batch().await?;
        if batch.is_empty() {
            return Ok(BatchSummary::default());
        }

        let mut summary = BatchSummary::default();
        let mut pending: Vec<(QueueItem, String, String)> = Vec::new();

        for item in batch {
            let Some(text) = self.extract_content(&item).await? else {
                // Nothing to embed (null field or row gone) — clear the entry.
                self.remove_from_queue(&item).await?;
                summary.skipped += 1;
                continue;
            };
            let text = self.maybe_decrypt(&item, text).await?;
            let text_hash = content_hash(&text);

            if self.existing_hash(&item).await?.as_deref() == Some(text_hash.as_str()) {
                // Content unchanged since the last embedding — no provider call.
                self.remove_from_queue(&item).await?;
                summary.skipped += 1;
                continue;
            }

            pending.push((item, text, text_hash));
        }

        if pending.is_empty() {
            return Ok(summary);
        }

        // One provider call for the whole batch.
        let texts: Vec<String> = pending.iter().map(|(_, t, _)| t.clone()).collect();
        let vectors = match self.provider.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                error!(error = %e, items = pending.len(), "batch embedding failed");
                for (item, _, _) in &pending {
                    self.fail_item(item, &e.to_string()).await?;
                }
                summary.failed += pending.len();
                return Ok(summary);
            }
        };

        for ((item, _, text_hash), vector) in pending.into_iter().zip(vectors) {
            match self.store_embedding(&item, &vector, &text_hash).await {
                Ok(()) => {
                    self.remove_from_queue(&item).await?;
                    summary.processed += 1;
                    debug!(
                        table = %item.table_name,
                        entity_id = %item.entity_id,
                        field = %item.field_name,
                        provider = self.provider.provider_name(),
                        "embedding stored"
                    );
                }
                Err(e) => {
                    warn!(
                        table = %item.table_name,
                        entity_id = %item.entity_id,
                        error = %e,
                        "failed to store embedding"
                    );
                    self.fail_item(&item, &e.to_string()).await?;
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Embed arbitrary texts with the configured provider.
    pub async fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.provider.embed(texts).await
    }

    /// Queue every non-deleted row of `table` whose embedding does not exist
    /// yet. Returns the number of pending entries for the table.
    pub async fn backfill(&self, table: &str) -> anyhow::Result<i64> {
        let spec = spec_for(table)
            .filter(|s| s.embedding_field.is_some())
            .ok_or_else(|| {
                let valid: Vec<&str> = embeddable_tables().map(|t| t.table).collect();
                anyhow::anyhow!(
                    "'{table}' is not an embeddable table; valid: {}",
                    valid.join(", ")
                )
            })?;
        let field = spec.embedding_field.expect("filtered on embedding_field");

        // Table and field names come from the static registry, not callers.
        let sql = format!(
            "INSERT INTO embedding_queue (table_name, entity_id, field_name, status) \
             SELECT '{table}', e.id, '{field}', 'pending' \
             FROM {table} e \
             LEFT JOIN embeddings_{table} emb \
               ON emb.entity_id = e.id AND emb.field_name = '{field}' \
             WHERE e.deleted_at IS NULL AND e.{field} IS NOT NULL AND emb.id IS NULL \
             ON CONFLICT (table_name, entity_id, field_name) DO NOTHING"
        );
        sqlx::query(&sql).execute(self.db.pool()).await?;

        let row = sqlx::query(
            "SELECT COUNT(*)::bigint AS cnt FROM embedding_queue \
             WHERE table_name = $1 AND status = 'pending'",
        )
        .bind(table)
        .fetch_one(self.db.pool())
        .await?;
        let count: i64 = row.get("cnt");
        info!(table, pending = count, "embedding backfill queued");
        Ok(count)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn claim_batch(&self) -> anyhow::Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            "UPDATE embedding_queue \
             SET status = 'processing', attempts = attempts + 1 \
             WHERE id IN ( \
                 SELECT id FROM embedding_queue \
                 WHERE status = 'pending' \
                 ORDER BY created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING table_name, entity_id, field_name",
        )
        .bind(self.batch_size)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| QueueItem {
                table_name: r.get("table_name"),
                entity_id: r.get("entity_id"),
                field_name: r.get("field_name"),
            })
            .collect())
    }

    async fn extract_content(&self, item: &QueueItem) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT content_for_embedding($1, $2, $3) AS content")
            .bind(&item.table_name)
            .bind(item.entity_id)
            .bind(&item.field_name)
            .fetch_one(self.db.pool())
            .await?;
        let content: Option<String> = row.get("content");
        Ok(content.filter(|c| !c.is_empty()))
    }

    /// If the source table is encrypted and the tenant has a DEK, decrypt the
    /// stored value; otherwise embed the stored string as-is.
    async fn maybe_decrypt(&self, item: &QueueItem, text: String) -> anyhow::Result<String> {
        let Some(spec) = spec_for(&item.table_name) else {
            return Ok(text);
        };
        if !spec.is_encrypted() {
            return Ok(text);
        }

        let sql = format!("SELECT tenant_id FROM {} WHERE id = $1", spec.table);
        let row = sqlx::query(&sql)
            .bind(item.entity_id)
            .fetch_optional(self.db.pool())
            .await?;
        let Some(tenant_id) = row.and_then(|r| r.get::<Option<String>, _>("tenant_id")) else {
            return Ok(text);
        };

        let Some(dek) = self.encryption.get_dek(&tenant_id).await? else {
            return Ok(text);
        };
        Ok(
            try_decrypt_value(&dek, &tenant_id, &item.entity_id.to_string(), &text)
                .unwrap_or(text),
        )
    }

    async fn existing_hash(&self, item: &QueueItem) -> anyhow::Result<Option<String>> {
        let sql = format!(
            "SELECT content_hash FROM embeddings_{} \
             WHERE entity_id = $1 AND field_name = $2 AND provider = $3",
            item.table_name
        );
        let row = sqlx::query(&sql)
            .bind(item.entity_id)
            .bind(&item.field_name)
            .bind(self.provider.provider_name())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("content_hash")))
    }

    async fn store_embedding(
        &self,
        item: &QueueItem,
        vector: &[f32],
        text_hash: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("SELECT upsert_embedding($1, $2, $3, $4, $5, $6)")
            .bind(&item.table_name)
            .bind(item.entity_id)
            .bind(&item.field_name)
            .bind(Vector::from(vector.to_vec()))
            .bind(self.provider.provider_name())
            .bind(text_hash)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn remove_from_queue(&self, item: &QueueItem) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM embedding_queue \
             WHERE table_name = $1 AND entity_id = $2 AND field_name = $3",
        )
        .bind(&item.table_name)
        .bind(item.entity_id)
        .bind(&item.field_name)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn fail_item(&self, item: &QueueItem, error: &str) -> anyhow::Result<()> {
        sqlx::query("SELECT fail_embedding($1, $2, $3, $4)")
            .bind(&item.table_name)
            .bind(item.entity_id)
            .bind(&item.field_name)
            .bind(error)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Lets the dialect engine auto-embed SEARCH query text with whatever
/// provider the process is configured with.
///
/// Wraps `Arc<dyn EmbeddingProvider>` in a local newtype because `QueryEmbedder`
/// is a foreign trait (defined in `p8-store`) and the orphan rules forbid
/// implementing it directly for a foreign `Arc<dyn ...>`.
pub struct QueryEmbedderHandle(pub Arc<dyn EmbeddingProvider>);

#[async_trait]
impl QueryEmbedder for QueryEmbedderHandle {
    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.0.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("provider returned no vector"))
    }

    fn provider_name(&self) -> &str {
        EmbeddingProvider::provider_name(self.0.as_ref())
    }
}
