//! Multipart upload. Small files are ingested synchronously; large ones go
//! through the tiered queue.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use p8_queue::handlers::persist_chunks;
use p8_store::Repository;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

const UPLOAD_DIR: &str = "data/uploads";

pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());
    let tenant_id = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let mut file_name = None;
    let mut mime_type = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            file_name = field.file_name().map(str::to_string);
            mime_type = field.content_type().map(str::to_string);
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("upload read failed: {e}")))?
                    .to_vec(),
            );
        }
    }

    let bytes = bytes.ok_or_else(|| ApiError::BadRequest("missing 'file' field".to_string()))?;
    let file_name = file_name.unwrap_or_else(|| "upload".to_string());
    let size_bytes = bytes.len() as i64;

    // Persist the blob locally; the object-store collaborator replaces this
    // URI scheme in cloud deployments.
    tokio::fs::create_dir_all(UPLOAD_DIR)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    let blob_id = Uuid::new_v4();
    let path = format!("{UPLOAD_DIR}/{blob_id}-{file_name}");
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    let uri = format!("file://{path}");

    let file_repo =
        Repository::for_table(state.db.clone(), "files", Arc::clone(&state.encryption))?;
    let mut file_row = serde_json::Map::new();
    file_row.insert("name".into(), json!(file_name));
    file_row.insert("mime_type".into(), json!(mime_type));
    file_row.insert("size_bytes".into(), json!(size_bytes));
    file_row.insert("uri".into(), json!(uri));
    file_row.insert("processing_status".into(), json!("pending"));
    if let Some(user) = user_id {
        file_row.insert("user_id".into(), json!(user.to_string()));
    }
    if let Some(tenant) = &tenant_id {
        file_row.insert("tenant_id".into(), json!(tenant));
    }
    let stored = file_repo.upsert(file_row).await?;
    let file_id = stored
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("file upsert returned no id")))?;

    // An upload session groups the artifacts for later recall.
    let session_repo =
        Repository::for_table(state.db.clone(), "sessions", Arc::clone(&state.encryption))?;
    let mut session = serde_json::Map::new();
    session.insert("id".into(), json!(Uuid::new_v4().to_string()));
    session.insert("name".into(), json!(format!("upload-{blob_id}")));
    session.insert("mode".into(), json!("upload"));
    if let Some(user) = user_id {
        session.insert("user_id".into(), json!(user.to_string()));
    }
    if let Some(tenant) = &tenant_id {
        session.insert("tenant_id".into(), json!(tenant));
    }
    let session = session_repo.upsert(session).await?;
    let session_id = session.get("id").cloned().unwrap_or(Value::Null);

    let threshold = state.settings.worker.file_processing_threshold_bytes;
    if size_bytes <= threshold {
        // Small file: extract, chunk, and finish inline.
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let resource_ids = persist_chunks(
            &state.db,
            &state.encryption,
            &file_name,
            &uri,
            &text,
            tenant_id.as_deref(),
            user_id,
        )
        .await
        .map_err(ApiError::Internal)?;

        sqlx::query(
            "UPDATE files SET processing_status = 'completed', parsed_content = $2, \
             updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(file_id)
        .bind(&text)
        .execute(state.db.pool())
        .await?;

        info!(%file_id, chunks = resource_ids.len(), "upload ingested inline");
        Ok(Json(json!({
            "file_id": file_id.to_string(),
            "status": "completed",
            "chunk_count": resource_ids.len(),
            "resource_ids": resource_ids,
            "session_id": session_id,
        })))
    } else {
        // Large file: route through the queue; tier derives from size.
        let task_id = state
            .queue
            .enqueue_file(file_id, user_id, tenant_id.as_deref())
            .await?;
        info!(%file_id, %task_id, size_bytes, "upload queued");
        Ok(Json(json!({
            "file_id": file_id.to_string(),
            "status": "queued",
            "task_id": task_id.to_string(),
            "chunk_count": 0,
            "resource_ids": [],
            "session_id": session_id,
        })))
    }
}
