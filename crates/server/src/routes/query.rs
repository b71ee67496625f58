//! Dialect query endpoints: structured JSON and raw strings.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use p8_store::RemQueryEngine;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

pub async fn structured(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<Value>> {
    let engine = RemQueryEngine::new(
        state.db.clone(),
        p8_embed::QueryEmbedderHandle(state.provider.clone()),
    );
    let results = engine
        .execute(&request.query, request.tenant_id.as_deref(), request.user_id)
        .await?;
    Ok(Json(json!({ "results": results, "count": results.len() })))
}

/// Raw dialect string in the body; scoping via headers is intentionally not
/// supported here — the raw endpoint is an operator tool.
pub async fn raw(State(state): State<AppState>, body: String) -> ApiResult<Json<Value>> {
    let engine = RemQueryEngine::new(
        state.db.clone(),
        p8_embed::QueryEmbedderHandle(state.provider.clone()),
    );
    let results = engine.execute(&body, None, None).await?;
    Ok(Json(json!({ "results": results, "count": results.len() })))
}
