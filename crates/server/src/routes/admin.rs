//! Operator endpoints: queue overview and the notification callback that
//! in-database cron jobs hit over HTTP.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use p8_store::Repository;
use p8_store::ids::normalize_key;

use crate::error::ApiResult;
use crate::AppState;

pub async fn queue_overview(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.queue.stats().await?;
    let status_counts = state.queue.status_counts().await?;
    let pending = state.queue.summary_by_type("pending").await?;
    let failed = state.queue.summary_by_type("failed").await?;
    let schedule = state.queue.task_schedule().await?;
    let cron = state.queue.cron_jobs().await?;

    Ok(Json(json!({
        "stats": stats,
        "status_counts": status_counts,
        "pending": pending,
        "failed": failed,
        "schedule": schedule,
        "cron": cron,
    })))
}

#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Record a notification as a moment. Push transports (APNs/FCM) are
/// external collaborators; this endpoint is their dispatch point.
pub async fn send_notification(
    State(state): State<AppState>,
    Json(request): Json<NotificationRequest>,
) -> ApiResult<Json<Value>> {
    let repo = Repository::for_table(
        state.db.clone(),
        "moments",
        Arc::clone(&state.encryption),
    )?;

    let name = format!(
        "notification-{}-{}",
        normalize_key(&request.title),
        &request.user_id.simple().to_string()[..8],
    );
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!(name));
    data.insert("moment_type".into(), json!("notification"));
    data.insert("summary".into(), json!(format!("{}: {}", request.title, request.body)));
    data.insert("user_id".into(), json!(request.user_id.to_string()));
    if let Some(tenant) = &request.tenant_id {
        data.insert("tenant_id".into(), json!(tenant));
    }
    let stored = repo.upsert(data).await?;

    info!(user_id = %request.user_id, title = %request.title, "notification recorded");
    Ok(Json(json!({
        "status": "recorded",
        "moment_name": stored.get("name").cloned().unwrap_or(Value::Null),
    })))
}
