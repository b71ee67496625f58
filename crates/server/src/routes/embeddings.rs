//! Embedding endpoints: drain one queue batch, or embed arbitrary texts.
//! `/embeddings/process` is what the in-database scheduler calls over HTTP
//! when no polling worker runs in-process.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use p8_embed::EmbeddingProvider;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub async fn process(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let summary = state
        .embedding
        .process_batch()
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!(summary)))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub texts: Vec<String>,
}

pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Json<Value>> {
    if request.texts.is_empty() {
        return Err(ApiError::BadRequest("texts must not be empty".to_string()));
    }
    let vectors = state
        .embedding
        .embed_texts(&request.texts)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!({
        "provider": state.provider.provider_name(),
        "dimensions": state.provider.dimensions(),
        "embeddings": vectors,
    })))
}
