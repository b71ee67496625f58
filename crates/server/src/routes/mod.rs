//! Route assembly.

mod admin;
mod chat;
mod content;
mod embeddings;
mod query;
mod schemas;

use axum::Router;
use axum::routing::{get, post};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/chat/:session_id", post(chat::chat))
        .route("/content/", post(content::upload))
        .route("/embeddings/process", post(embeddings::process))
        .route("/embeddings/generate", post(embeddings::generate))
        .route("/query/", post(query::structured))
        .route("/query/raw", post(query::raw))
        .route("/schemas/", post(schemas::upsert).get(schemas::list))
        .route(
            "/schemas/:id",
            get(schemas::get_one).delete(schemas::delete_one),
        )
        .route("/notifications/send", post(admin::send_notification))
        .route("/admin/queue", get(admin::queue_overview))
        .with_state(state)
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}
