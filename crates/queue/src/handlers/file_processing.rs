//! File processing: fetch the blob, extract text, chunk, persist resources.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use p8_store::Repository;
use p8_store::ids::normalize_key;
use p8_store::usage::increment_usage;

use crate::worker::{TaskHandler, WorkerContext};
use crate::Task;

const CHUNK_MAX_CHARS: usize = 1500;
const CHUNK_OVERLAP: usize = 200;

pub struct FileProcessingHandler;

#[async_trait]
impl TaskHandler for FileProcessingHandler {
    async fn handle(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<Value> {
        let payload = task.payload_object();
        let file_id = payload["file_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok());
        let uri = payload["uri"].as_str().map(str::to_string);
        let name = payload["name"].as_str().unwrap_or("unknown").to_string();
        let size_bytes = payload["size_bytes"].as_i64().unwrap_or(0);

        info!(?file_id, name = %name, size_bytes, "processing file");

        if let Some(id) = file_id {
            set_file_status(ctx, id, "processing").await?;
        }

        let Some(uri) = uri else {
            warn!(?file_id, "file task has no uri; skipping");
            if let Some(id) = file_id {
                set_file_status(ctx, id, "failed").await?;
            }
            return Ok(json!({ "bytes_processed": 0, "chunks": 0, "status": "skipped_no_uri" }));
        };

        let result: anyhow::Result<Value> = async {
            let text = fetch_text(&uri).await?;
            let resource_ids = persist_chunks(
                &ctx.db,
                &ctx.encryption,
                &name,
                &uri,
                &text,
                task.tenant_id.as_deref(),
                task.user_id,
            )
            .await?;

            if let Some(id) = file_id {
                sqlx::query(
                    "UPDATE files SET processing_status = 'completed', \
                     parsed_content = $2, updated_at = CURRENT_TIMESTAMP \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&text)
                .execute(ctx.db.pool())
                .await?;
            }

            info!(?file_id, chunks = resource_ids.len(), chars = text.len(), "file processed");
            Ok(json!({
                "bytes_processed": size_bytes,
                "chunks": resource_ids.len(),
                "total_chars": text.len(),
                "resource_ids": resource_ids,
            }))
        }
        .await;

        match result {
            Ok(summary) => {
                // Post-flight: account actual bytes against the monthly budget.
                if let Some(user_id) = task.user_id {
                    if size_bytes > 0 {
                        let plan = ctx.queue.plan_cache().get_user_plan(&ctx.db, user_id).await?;
                        let _ = increment_usage(
                            &ctx.db,
                            user_id,
                            "worker_bytes_processed",
                            size_bytes,
                            &plan,
                        )
                        .await;
                    }
                }
                Ok(summary)
            }
            Err(e) => {
                if let Some(id) = file_id {
                    set_file_status(ctx, id, "failed").await?;
                }
                Err(e)
            }
        }
    }
}

async fn set_file_status(ctx: &WorkerContext, file_id: Uuid, status: &str) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE files SET processing_status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2",
    )
    .bind(status)
    .bind(file_id)
    .execute(ctx.db.pool())
    .await?;
    Ok(())
}

/// Chunk extracted text into resources addressed by (file name, ordinal).
/// Shared by this handler and the synchronous upload path.
pub async fn persist_chunks(
    db: &p8_store::Db,
    encryption: &std::sync::Arc<p8_crypto::EncryptionService>,
    name: &str,
    uri: &str,
    text: &str,
    tenant_id: Option<&str>,
    user_id: Option<Uuid>,
) -> anyhow::Result<Vec<String>> {
    let chunks = chunk_text(text, CHUNK_MAX_CHARS, CHUNK_OVERLAP);
    let repo = Repository::for_table(db.clone(), "resources", std::sync::Arc::clone(encryption))?;
    let base_key = normalize_key(name);

    let mut resource_ids = Vec::with_capacity(chunks.len());
    for (ordinal, chunk) in chunks.iter().enumerate() {
        let mut data = serde_json::Map::new();
        data.insert("name".into(), json!(format!("{base_key}-{ordinal}")));
        data.insert("uri".into(), json!(uri));
        data.insert("ordinal".into(), json!(ordinal as i64));
        data.insert("content".into(), json!(chunk));
        data.insert("category".into(), json!("file_chunk"));
        if let Some(tenant) = tenant_id {
            data.insert("tenant_id".into(), json!(tenant));
        }
        if let Some(user) = user_id {
            data.insert("user_id".into(), json!(user.to_string()));
        }
        let stored = repo.upsert(data).await?;
        if let Some(id) = stored.get("id").and_then(Value::as_str) {
            resource_ids.push(id.to_string());
        }
    }
    Ok(resource_ids)
}

/// Fetch a blob and coerce it to text. `file://` reads from disk; http(s)
/// downloads. Binary content degrades to lossy UTF-8 — real extraction for
/// rich formats is the extraction collaborator's job.
pub async fn fetch_text(uri: &str) -> anyhow::Result<String> {
    if let Some(path) = uri.strip_prefix("file://") {
        let bytes = tokio::fs::read(path).await?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = reqwest::get(uri).await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("blob fetch returned {status} for {uri}");
        }
        let bytes = response.bytes().await?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }
    // Bare paths are treated as local files.
    let bytes = tokio::fs::read(uri).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Sliding-window chunking on char boundaries.
fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let step = max_chars.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello", 1500, 200);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", 1500, 200).is_empty());
    }

    #[test]
    fn chunks_overlap_by_the_configured_amount() {
        let text = "abcdefghij".repeat(50); // 500 chars
        let chunks = chunk_text(&text, 200, 50);
        assert!(chunks.len() > 1);
        for window in chunks.windows(2) {
            let prev_tail: String = window[0].chars().rev().take(50).collect::<Vec<_>>()
                .into_iter().rev().collect();
            assert!(window[1].starts_with(&prev_tail));
        }
    }

    #[test]
    fn all_content_is_covered() {
        let text: String = ('a'..='z').cycle().take(5000).collect();
        let chunks = chunk_text(&text, 1500, 200);
        let mut rebuilt = chunks[0].clone();
        for chunk in &chunks[1..] {
            rebuilt.push_str(&chunk[chunk.char_indices().nth(200).map(|(i, _)| i).unwrap_or(0)..]);
        }
        assert_eq!(rebuilt, text);
    }
}
