//! Ontology registry CRUD.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use p8_store::Repository;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

fn schemas_repo(state: &AppState) -> ApiResult<Repository> {
    Ok(Repository::for_table(
        state.db.clone(),
        "schemas",
        Arc::clone(&state.encryption),
    )?)
}

/// Upsert a schema. Ids are deterministic over the name, so posting the same
/// name twice targets the same row.
pub async fn upsert(
    State(state): State<AppState>,
    Json(body): Json<Map<String, Value>>,
) -> ApiResult<Json<Value>> {
    let name = body.get("name").and_then(Value::as_str).unwrap_or_default();
    if name.is_empty() {
        return Err(ApiError::BadRequest("schema requires a name".to_string()));
    }
    let stored = schemas_repo(&state)?.upsert(body).await?;
    Ok(Json(Value::Object(stored)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Value>> {
    let rows = sqlx::query_scalar::<_, Value>(
        "SELECT to_jsonb(s) FROM schemas s \
         WHERE s.deleted_at IS NULL AND ($1::text IS NULL OR s.kind = $1) \
         ORDER BY s.name LIMIT $2",
    )
    .bind(params.kind)
    .bind(params.limit)
    .fetch_all(state.db.pool())
    .await?;
    Ok(Json(json!({ "results": rows, "count": rows.len() })))
}

/// Fetch by uuid, or by natural name when the segment is not a uuid.
pub async fn get_one(
    State(state): State<AppState>,
    Path(id_or_name): Path<String>,
) -> ApiResult<Json<Value>> {
    let repo = schemas_repo(&state)?;
    let found = match Uuid::parse_str(&id_or_name) {
        Ok(id) => repo.get(id).await?,
        Err(_) => repo.get_by_name(&id_or_name).await?,
    };
    found
        .map(|row| Json(Value::Object(row)))
        .ok_or(ApiError::NotFound)
}

pub async fn delete_one(
    State(state): State<AppState>,
    Path(id_or_name): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = match Uuid::parse_str(&id_or_name) {
        Ok(id) => id,
        Err(_) => p8_store::deterministic_id("schemas", &id_or_name),
    };
    let removed = schemas_repo(&state)?.soft_delete(id).await?;
    if !removed {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": id.to_string() })))
}
