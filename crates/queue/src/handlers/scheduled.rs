//! Scheduled maintenance tasks, dispatched by `payload.action`.

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::Row;
use tracing::{info, warn};

use crate::worker::{TaskHandler, WorkerContext};
use crate::Task;

pub struct ScheduledHandler;

#[async_trait]
impl TaskHandler for ScheduledHandler {
    async fn handle(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<Value> {
        let payload = task.payload_object();
        let action = payload["action"].as_str().unwrap_or("unknown");
        info!(action, "scheduled task");

        match action {
            "kv_rebuild" => {
                sqlx::query("SELECT rebuild_kv_store()")
                    .execute(ctx.db.pool())
                    .await?;
                let row = sqlx::query("SELECT COUNT(*)::bigint AS cnt FROM kv_store")
                    .fetch_one(ctx.db.pool())
                    .await?;
                let entries: i64 = row.get("cnt");
                info!(entries, "kv store rebuilt");
                Ok(json!({ "action": "kv_rebuild", "entries": entries }))
            }

            "kv_rebuild_incremental" => {
                let row = sqlx::query("SELECT rebuild_kv_store_incremental() AS updated")
                    .fetch_one(ctx.db.pool())
                    .await?;
                let updated: i32 = row.get("updated");
                info!(updated, "kv store incrementally rebuilt");
                Ok(json!({ "action": "kv_rebuild_incremental", "rows_updated": updated }))
            }

            "embedding_backfill" => {
                let Some(table) = payload["table"].as_str() else {
                    return Ok(json!({
                        "action": "embedding_backfill",
                        "error": "no table specified",
                    }));
                };
                let queued = ctx.embedding.backfill(table).await?;
                Ok(json!({
                    "action": "embedding_backfill",
                    "table": table,
                    "queued": queued,
                }))
            }

            other => {
                warn!(action = other, "unknown scheduled action");
                Ok(json!({ "status": "unknown_action", "action": other }))
            }
        }
    }
}
