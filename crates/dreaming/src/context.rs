//! Bounded context window assembly for the dreaming agent.
//!
//! Four sections, each added only if it fits the remaining token budget:
//! recent moments, recent session excerpts, recent uploads, and resources
//! referenced by moment graph edges. The budget is ~30% of the model context.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use p8_crypto::{EncryptionService, try_decrypt_value};
use p8_store::entity::GraphEdge;
use p8_store::ids::estimate_tokens;
use p8_store::Db;

const CONTEXT_BUDGET_RATIO: f64 = 0.30;
const MODEL_CONTEXT_LIMIT: i64 = 128_000;
const MAX_RESOURCE_CHARS: usize = 2000;
const MAX_MOMENTS: i64 = 50;
const MAX_SESSIONS: i64 = 5;
const MAX_MESSAGES_PER_SESSION: i64 = 20;
const MAX_RESOURCES: usize = 10;
const MESSAGE_PREVIEW_CHARS: usize = 500;

fn data_token_budget() -> i64 {
    (MODEL_CONTEXT_LIMIT as f64 * CONTEXT_BUDGET_RATIO) as i64
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ContextStats {
    pub moments: usize,
    pub sessions: usize,
    pub messages: usize,
    pub resources: usize,
    pub token_estimate: i64,
}

/// Load the user's recent activity into a text context, staying within the
/// token budget. Returns the rendered context and collection stats.
pub async fn load_dreaming_context(
    user_id: Uuid,
    lookback_days: i64,
    db: &Db,
    encryption: &Arc<EncryptionService>,
) -> anyhow::Result<(String, ContextStats)> {
    let cutoff = Utc::now() - Duration::days(lookback_days.max(0));
    let budget = data_token_budget();

    let mut sections: Vec<String> = Vec::new();
    let mut token_estimate: i64 = 0;
    let mut stats = ContextStats::default();
    let mut referenced_keys: HashSet<String> = HashSet::new();

    // 1. Recent moments, decrypted, with their outgoing edges collected.
    let moment_rows = sqlx::query(
        "SELECT id, tenant_id, name, moment_type, summary, topic_tags, graph_edges \
         FROM moments \
         WHERE user_id = $1 AND deleted_at IS NULL AND created_at >= $2 \
         ORDER BY created_at DESC LIMIT $3",
    )
    .bind(user_id)
    .bind(cutoff)
    .bind(MAX_MOMENTS)
    .fetch_all(db.pool())
    .await?;

    if !moment_rows.is_empty() {
        let mut lines = vec!["## Recent Moments\n".to_string()];
        for row in &moment_rows {
            let id: Uuid = row.get("id");
            let tenant_id: Option<String> = row.get("tenant_id");
            let name: String = row.get("name");
            let moment_type: String = row.get("moment_type");
            let summary = decrypt_field(
                encryption,
                tenant_id.as_deref(),
                &id.to_string(),
                row.get::<Option<String>, _>("summary"),
            )
            .await;
            let tags: Vec<String> = row.get("topic_tags");
            let edges = GraphEdge::parse_array(&row.get::<Value, _>("graph_edges"));

            lines.push(format!(
                "### {name} ({moment_type})\n{}\nTags: {}\n",
                summary.unwrap_or_default(),
                if tags.is_empty() { "none".to_string() } else { tags.join(", ") },
            ));
            for edge in edges {
                referenced_keys.insert(edge.target);
            }
            stats.moments += 1;
        }
        push_if_fits(&mut sections, &mut token_estimate, budget, lines.join("\n"));
    }

    // 2. Recent sessions, most-recent messages reversed into chronology.
    let session_rows = sqlx::query(
        "SELECT id, name FROM sessions \
         WHERE user_id = $1 AND deleted_at IS NULL AND updated_at >= $2 \
         ORDER BY updated_at DESC LIMIT $3",
    )
    .bind(user_id)
    .bind(cutoff)
    .bind(MAX_SESSIONS)
    .fetch_all(db.pool())
    .await?;

    if !session_rows.is_empty() {
        let mut lines = vec!["## Recent Sessions\n".to_string()];
        for session in &session_rows {
            let session_id: Uuid = session.get("id");
            let session_name: String = session.get("name");
            stats.sessions += 1;

            let messages = sqlx::query(
                "SELECT id, tenant_id, message_type, content FROM messages \
                 WHERE session_id = $1 AND deleted_at IS NULL \
                 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(session_id)
            .bind(MAX_MESSAGES_PER_SESSION)
            .fetch_all(db.pool())
            .await?;

            if messages.is_empty() {
                continue;
            }
            lines.push(format!("### Session: {session_name}\n"));
            for message in messages.iter().rev() {
                let id: Uuid = message.get("id");
                let tenant_id: Option<String> = message.get("tenant_id");
                let message_type: String = message.get("message_type");
                let content = decrypt_field(
                    encryption,
                    tenant_id.as_deref(),
                    &id.to_string(),
                    message.get::<Option<String>, _>("content"),
                )
                .await
                .unwrap_or_default();
                lines.push(format!("[{message_type}] {}", truncate(&content, MESSAGE_PREVIEW_CHARS)));
                stats.messages += 1;
            }
            lines.push(String::new());
        }
        push_if_fits(&mut sections, &mut token_estimate, budget, lines.join("\n"));
    }

    // 3. Recently completed uploads, independent of graph edges.
    let file_rows = sqlx::query(
        "SELECT id, name, mime_type, parsed_content FROM files \
         WHERE user_id = $1 AND deleted_at IS NULL \
           AND processing_status = 'completed' AND created_at >= $2 \
         ORDER BY created_at DESC LIMIT $3",
    )
    .bind(user_id)
    .bind(cutoff)
    .bind(MAX_RESOURCES as i64)
    .fetch_all(db.pool())
    .await?;

    let mut seen_file_ids: HashSet<Uuid> = HashSet::new();
    if !file_rows.is_empty() {
        let mut lines = vec!["## Recent Uploads\n".to_string()];
        for row in &file_rows {
            let id: Uuid = row.get("id");
            let name: String = row.get("name");
            let mime_type: Option<String> = row.get("mime_type");
            let content: Option<String> = row.get("parsed_content");
            lines.push(format!(
                "### {name} ({})\n{}\n",
                mime_type.as_deref().unwrap_or("unknown"),
                truncate(&content.unwrap_or_default(), MAX_RESOURCE_CHARS),
            ));
            stats.resources += 1;
            seen_file_ids.insert(id);
        }
        push_if_fits(&mut sections, &mut token_estimate, budget, lines.join("\n"));
    }

    // 4. Resources referenced by the collected edges, skipping shown files.
    if !referenced_keys.is_empty() {
        let mut lines = vec!["## Referenced Resources\n".to_string()];
        let mut looked_up = 0;
        for key in referenced_keys.iter().take(MAX_RESOURCES) {
            let kv = sqlx::query(
                "SELECT entity_type, entity_id, content_summary \
                 FROM kv_store WHERE entity_key = $1 LIMIT 1",
            )
            .bind(key)
            .fetch_optional(db.pool())
            .await?;
            let Some(kv) = kv else { continue };

            let entity_type: String = kv.get("entity_type");
            let entity_id: Uuid = kv.get("entity_id");
            let summary: Option<String> = kv.get("content_summary");

            if entity_type == "files" && seen_file_ids.contains(&entity_id) {
                continue;
            }

            let content = match entity_type.as_str() {
                "resources" => sqlx::query(
                    "SELECT content FROM resources WHERE id = $1 AND deleted_at IS NULL",
                )
                .bind(entity_id)
                .fetch_optional(db.pool())
                .await?
                .and_then(|r| r.get::<Option<String>, _>("content")),
                "files" => sqlx::query(
                    "SELECT parsed_content FROM files WHERE id = $1 AND deleted_at IS NULL",
                )
                .bind(entity_id)
                .fetch_optional(db.pool())
                .await?
                .and_then(|r| r.get::<Option<String>, _>("parsed_content")),
                _ => None,
            };

            let body = content.or(summary).unwrap_or_default();
            if body.is_empty() {
                continue;
            }
            lines.push(format!(
                "### {key} ({entity_type})\n{}\n",
                truncate(&body, MAX_RESOURCE_CHARS),
            ));
            looked_up += 1;
            stats.resources += 1;
        }

        if looked_up > 0 {
            push_if_fits(&mut sections, &mut token_estimate, budget, lines.join("\n"));
        }
    }

    stats.token_estimate = token_estimate;
    Ok((sections.join("\n\n"), stats))
}

/// Decrypt one stored field when the tenant has a server-side DEK; otherwise
/// return the stored string.
async fn decrypt_field(
    encryption: &Arc<EncryptionService>,
    tenant_id: Option<&str>,
    entity_id: &str,
    stored: Option<String>,
) -> Option<String> {
    let stored = stored?;
    let Some(tenant_id) = tenant_id else { return Some(stored) };
    let Ok(Some(dek)) = encryption.get_dek(tenant_id).await else {
        return Some(stored);
    };
    Some(try_decrypt_value(&dek, tenant_id, entity_id, &stored).unwrap_or(stored))
}

fn push_if_fits(sections: &mut Vec<String>, used: &mut i64, budget: i64, section: String) {
    let cost = estimate_tokens(&section);
    if *used + cost <= budget {
        sections.push(section);
        *used += cost;
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_thirty_percent_of_model_context() {
        assert_eq!(data_token_budget(), 38_400);
    }

    #[test]
    fn sections_beyond_budget_are_dropped() {
        let mut sections = Vec::new();
        let mut used = 0;
        push_if_fits(&mut sections, &mut used, 10, "tiny".to_string());
        assert_eq!(sections.len(), 1);

        // ~25 tokens, over the remaining budget of 9.
        push_if_fits(&mut sections, &mut used, 10, "x".repeat(100));
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactlyten", 10), "exactlyten");
        assert_eq!(truncate("0123456789ab", 10), "0123456789...");
        // Multi-byte chars are counted, not sliced.
        let emoji = "🚀".repeat(12);
        assert_eq!(truncate(&emoji, 10).chars().count(), 13);
    }
}
