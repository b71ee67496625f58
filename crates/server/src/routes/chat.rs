//! Streaming agent chat over SSE.
//!
//! Pre-flight checks the `chat_tokens` quota; post-flight increments it with
//! the actual API usage. Client disconnects drop the stream, which aborts the
//! generation task.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use p8_llm::{ChatOptions, ChatTurn};
use p8_store::usage::{check_quota, increment_usage};
use p8_store::{Repository, deterministic_id};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
}

pub async fn chat(
    State(state): State<AppState>,
    Path(session_ref): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }

    let user_id = header_uuid(&headers, "x-user-id");
    let tenant_id = header_str(&headers, "x-tenant-id");
    let agent_name = header_str(&headers, "x-agent-name");
    let session_name = header_str(&headers, "x-session-name")
        .unwrap_or_else(|| format!("chat-{session_ref}"));

    // Pre-flight quota: known users only; anonymous service calls pass.
    let plan_id = match user_id {
        Some(user_id) => {
            let plan = state
                .queue
                .plan_cache()
                .get_user_plan(&state.db, user_id)
                .await?;
            let status = check_quota(&state.db, user_id, "chat_tokens", &plan).await?;
            if status.exceeded {
                return Err(ApiError::quota("chat_tokens", status.used, status.limit));
            }
            Some(plan)
        }
        None => None,
    };

    // The path segment is either a session uuid or a natural name.
    let session_id = Uuid::parse_str(&session_ref)
        .unwrap_or_else(|_| deterministic_id("sessions", &session_ref));

    let session_repo = Repository::for_table(
        state.db.clone(),
        "sessions",
        Arc::clone(&state.encryption),
    )?;
    let mut session = serde_json::Map::new();
    session.insert("id".into(), json!(session_id.to_string()));
    session.insert("name".into(), json!(session_name));
    session.insert("mode".into(), json!("chat"));
    if let Some(agent) = &agent_name {
        session.insert("agent_name".into(), json!(agent));
    }
    if let Some(user) = user_id {
        session.insert("user_id".into(), json!(user.to_string()));
    }
    if let Some(tenant) = &tenant_id {
        session.insert("tenant_id".into(), json!(tenant));
    }
    session_repo.upsert(session).await?;

    // Agent instructions from the registry, generic assistant fallback.
    let instructions = load_agent_instructions(&state, agent_name.as_deref()).await?;
    let model = state.settings.llm.default_model.clone();

    // Prior turns, newest-last, within the context budget.
    let history = state
        .db
        .rem_load_messages(
            session_id,
            Some(state.settings.memory.context_token_budget as i64),
            None,
            None,
        )
        .await?;

    let mut turns = vec![ChatTurn::System(instructions)];
    for entry in &history {
        let role = entry["message_type"].as_str().unwrap_or("user");
        let content = entry["content"].as_str().unwrap_or_default();
        match role {
            "assistant" => turns.push(ChatTurn::assistant_text(content)),
            "user" => turns.push(ChatTurn::User(content.to_string())),
            _ => {} // tool traces are not replayed into the prompt
        }
    }
    turns.push(ChatTurn::User(request.prompt.clone()));

    let (tx, rx) = mpsc::channel::<Event>(64);
    let prompt = request.prompt.clone();
    let moment_threshold = state.settings.memory.moment_token_threshold;

    tokio::spawn(async move {
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let llm = state.llm.clone();
        let options = ChatOptions {
            temperature: Some(state.settings.llm.default_temperature),
            max_tokens: Some(state.settings.llm.default_max_tokens),
        };
        let generation =
            tokio::spawn(
                async move { llm.chat_stream(&model, &turns, None, &options, delta_tx).await },
            );

        while let Some(delta) = delta_rx.recv().await {
            let event = Event::default().data(json!({ "type": "text_delta", "content": delta }).to_string());
            if tx.send(event).await.is_err() {
                // Client went away; stop forwarding. The generation future is
                // dropped with this task when we return.
                generation.abort();
                return;
            }
        }

        match generation.await {
            Ok(Ok(response)) => {
                let persisted = state
                    .db
                    .rem_persist_turn(
                        session_id,
                        &prompt,
                        &response.text,
                        user_id,
                        tenant_id.as_deref(),
                        None,
                        None,
                        moment_threshold,
                    )
                    .await;
                if let Err(e) = &persisted {
                    error!(error = %e, "failed to persist chat turn");
                }

                if let (Some(user_id), Some(plan)) = (user_id, plan_id) {
                    let total = response.usage.total_tokens.max(0);
                    if total > 0 {
                        let _ = increment_usage(&state.db, user_id, "chat_tokens", total, &plan)
                            .await;
                    }
                }

                info!(%session_id, tokens = response.usage.total_tokens, "chat turn complete");
                let done = json!({
                    "type": "done",
                    "session_id": session_id.to_string(),
                    "finish_reason": response.finish_reason,
                    "usage": response.usage,
                    "moment_name": persisted
                        .ok()
                        .and_then(|v| v.get("moment_name").cloned())
                        .unwrap_or(Value::Null),
                });
                let _ = tx.send(Event::default().data(done.to_string())).await;
            }
            Ok(Err(e)) => {
                error!(error = %e, "chat generation failed");
                let _ = tx
                    .send(Event::default().data(json!({ "type": "error", "error": e.to_string() }).to_string()))
                    .await;
            }
            Err(_) => {} // aborted on disconnect
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn load_agent_instructions(
    state: &AppState,
    agent_name: Option<&str>,
) -> ApiResult<String> {
    if let Some(agent_name) = agent_name {
        let row = sqlx::query(
            "SELECT json_schema FROM schemas \
             WHERE name = $1 AND kind = 'agent' AND deleted_at IS NULL",
        )
        .bind(agent_name)
        .fetch_optional(state.db.pool())
        .await?;
        if let Some(row) = row {
            let schema: Value = row.get("json_schema");
            if let Some(instructions) = schema["instructions"].as_str() {
                return Ok(instructions.to_string());
            }
        }
    }
    Ok("You are a helpful personal memory assistant. Answer using the \
        conversation so far; be concise and concrete."
        .to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    header_str(headers, name).and_then(|value| Uuid::parse_str(&value).ok())
}
