//! Dream persistence: moments, bidirectional back-edges, and the agent's
//! message trace.

use serde_json::{Value, json};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use p8_llm::TraceEvent;
use p8_queue::WorkerContext;
use p8_store::entity::GraphEdge;
use p8_store::ids::estimate_tokens;
use p8_store::{Repository, merge_graph_edges};

use crate::DreamMoment;

/// Upsert each dream as a `moment_type = 'dream'` row and merge reciprocal
/// `dreamed_from` edges onto the entities it draws on. Returns the number of
/// moments saved; individual failures are logged, not fatal.
pub async fn persist_dream_moments(
    dream_moments: &[DreamMoment],
    user_id: Uuid,
    tenant_id: Option<&str>,
    session_id: Uuid,
    ctx: &WorkerContext,
) -> anyhow::Result<usize> {
    let repo = Repository::for_table(
        ctx.db.clone(),
        "moments",
        std::sync::Arc::clone(&ctx.encryption),
    )?;
    let mut saved = 0;

    for dream in dream_moments {
        let graph_edges: Vec<GraphEdge> = dream
            .affinity_fragments
            .iter()
            .filter(|fragment| !fragment.target.is_empty())
            .map(|fragment| GraphEdge {
                target: fragment.target.clone(),
                relation: fragment.relation.clone(),
                weight: fragment.weight,
                reason: fragment.reason.clone(),
            })
            .collect();

        let name = if dream.name.starts_with("dream-") {
            dream.name.clone()
        } else {
            format!("dream-{}", dream.name)
        };

        let mut data = serde_json::Map::new();
        data.insert("name".into(), json!(name));
        data.insert("moment_type".into(), json!("dream"));
        data.insert("summary".into(), json!(dream.summary));
        data.insert("topic_tags".into(), json!(dream.topic_tags));
        data.insert("emotion_tags".into(), json!(dream.emotion_tags));
        data.insert("graph_edges".into(), json!(graph_edges));
        data.insert("user_id".into(), json!(user_id.to_string()));
        data.insert("source_session_id".into(), json!(session_id.to_string()));
        data.insert("metadata".into(), json!({ "source": "dreaming" }));
        if let Some(tenant) = tenant_id {
            data.insert("tenant_id".into(), json!(tenant));
        }

        let stored = match repo.upsert(data).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(dream = %name, error = %e, "failed to persist dream moment");
                continue;
            }
        };
        saved += 1;
        let stored_name = stored
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&name)
            .to_string();

        for edge in &graph_edges {
            let back_edge = GraphEdge {
                target: stored_name.clone(),
                relation: "dreamed_from".to_string(),
                weight: edge.weight,
                reason: edge.reason.clone(),
            };
            if let Err(e) = merge_edge_on_target(ctx, &edge.target, back_edge).await {
                warn!(target = %edge.target, error = %e, "failed to merge back-edge");
            }
        }
    }

    info!(saved, "dream moments persisted");
    Ok(saved)
}

/// Resolve `target_key` through the KV index and merge the back-edge into the
/// SOURCE table's `graph_edges` — the index is ephemeral and re-syncs from
/// there on the next write.
async fn merge_edge_on_target(
    ctx: &WorkerContext,
    target_key: &str,
    new_edge: GraphEdge,
) -> anyhow::Result<()> {
    let kv = sqlx::query(
        "SELECT entity_type, entity_id FROM kv_store WHERE entity_key = $1 LIMIT 1",
    )
    .bind(target_key)
    .fetch_optional(ctx.db.pool())
    .await?;
    let Some(kv) = kv else { return Ok(()) };

    let entity_type: String = kv.get("entity_type");
    let entity_id: Uuid = kv.get("entity_id");
    if p8_store::registry::spec_for(&entity_type).is_none() {
        anyhow::bail!("kv_store references unknown table {entity_type}");
    }

    let select = format!("SELECT graph_edges FROM {entity_type} WHERE id = $1");
    let row = sqlx::query(&select)
        .bind(entity_id)
        .fetch_optional(ctx.db.pool())
        .await?;
    let Some(row) = row else { return Ok(()) };

    let existing = GraphEdge::parse_array(&row.get::<Value, _>("graph_edges"));
    let merged = merge_graph_edges(&existing, &[new_edge]);

    let update = format!("UPDATE {entity_type} SET graph_edges = $1 WHERE id = $2");
    sqlx::query(&update)
        .bind(json!(merged))
        .bind(entity_id)
        .execute(ctx.db.pool())
        .await?;
    Ok(())
}

/// Store the agent's trace as message rows in the dreaming session. System
/// prompts live in the agent definition and are never persisted.
pub async fn persist_agent_messages(
    session_id: Uuid,
    trace: &[TraceEvent],
    user_id: Uuid,
    tenant_id: Option<&str>,
    model: &str,
    agent_name: &str,
    ctx: &WorkerContext,
) -> anyhow::Result<()> {
    let repo = Repository::for_table(
        ctx.db.clone(),
        "messages",
        std::sync::Arc::clone(&ctx.encryption),
    )?;
    let mut total_tokens: i64 = 0;

    for event in trace {
        let (message_type, content, tool_calls) = match event {
            TraceEvent::User { content } => ("user", content.clone(), Value::Null),
            TraceEvent::Assistant { content, calls } => {
                let recorded = if calls.is_empty() {
                    Value::Null
                } else {
                    json!({
                        "calls": calls
                            .iter()
                            .map(|call| json!({
                                "name": call.name,
                                "id": call.id,
                                "arguments": call.arguments,
                            }))
                            .collect::<Vec<_>>()
                    })
                };
                ("assistant", content.clone(), recorded)
            }
            TraceEvent::ToolResult { name, call_id, content } => (
                "tool_response",
                content.clone(),
                json!({ "name": name, "id": call_id }),
            ),
        };

        let token_count = estimate_tokens(&content);
        total_tokens += token_count;

        let mut data = serde_json::Map::new();
        data.insert("id".into(), json!(Uuid::new_v4().to_string()));
        data.insert("session_id".into(), json!(session_id.to_string()));
        data.insert("message_type".into(), json!(message_type));
        data.insert("content".into(), json!(content));
        data.insert("token_count".into(), json!(token_count));
        data.insert("model".into(), json!(model));
        data.insert("agent_name".into(), json!(agent_name));
        data.insert("user_id".into(), json!(user_id.to_string()));
        if !tool_calls.is_null() {
            data.insert("tool_calls".into(), tool_calls);
        }
        if let Some(tenant) = tenant_id {
            data.insert("tenant_id".into(), json!(tenant));
        }
        repo.upsert(data).await?;
    }

    sqlx::query(
        "UPDATE sessions SET total_tokens = total_tokens + $1, \
         updated_at = CURRENT_TIMESTAMP WHERE id = $2",
    )
    .bind(total_tokens)
    .bind(session_id)
    .execute(ctx.db.pool())
    .await?;
    Ok(())
}
