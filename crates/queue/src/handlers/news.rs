//! Per-user news digest: a structured model run over the user's interests,
//! persisted as a moment and accounted against the daily search quota.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use p8_llm::{Agent, AgentConfig, structured_output};
use p8_store::Repository;
use p8_store::ids::normalize_key;
use p8_store::usage::increment_usage;

use crate::worker::{TaskHandler, WorkerContext};
use crate::Task;

#[derive(Debug, Deserialize)]
struct NewsDigest {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    topic_tags: Vec<String>,
}

pub struct NewsHandler;

#[async_trait]
impl TaskHandler for NewsHandler {
    async fn handle(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<Value> {
        let payload = task.payload_object();
        let user_id = payload["user_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .or(task.user_id);
        let Some(user_id) = user_id else {
            return Ok(json!({ "status": "skipped_no_user" }));
        };

        let interests = load_interests(ctx, user_id).await?;
        if interests.is_empty() {
            return Ok(json!({ "status": "skipped_no_interests" }));
        }

        let config = AgentConfig {
            model: ctx.settings.llm.default_model.clone(),
            instructions: "You are a news digest agent. Given a user's interest list, \
                           produce one concise digest of the most relevant recent \
                           developments. Reply with a json object: {\"headline\": ..., \
                           \"summary\": ..., \"topic_tags\": [...]}."
                .to_string(),
            request_limit: ctx.settings.llm.default_request_limit,
            token_limit: ctx.settings.llm.default_token_limit as i64,
            temperature: ctx.settings.llm.default_temperature,
            max_tokens: ctx.settings.llm.default_max_tokens,
        };
        let agent = Agent::new(ctx.llm.clone(), config);
        let run = agent
            .run(&format!("Interests: {}", interests.join(", ")))
            .await?;

        let digest = match structured_output::<NewsDigest>(&run.output) {
            Ok(digest) => digest,
            Err(error) => {
                // Keep the run: the raw reply still makes a readable digest.
                tracing::warn!(%error, "news digest was unstructured; storing raw text");
                NewsDigest {
                    headline: "news-digest".to_string(),
                    summary: run.output.clone(),
                    topic_tags: Vec::new(),
                }
            }
        };

        let name = format!(
            "news-{}-{}",
            normalize_key(&digest.headline),
            &user_id.simple().to_string()[..8]
        );
        let repo = Repository::for_table(
            ctx.db.clone(),
            "moments",
            std::sync::Arc::clone(&ctx.encryption),
        )?;
        let mut data = serde_json::Map::new();
        data.insert("name".into(), json!(name));
        data.insert("moment_type".into(), json!("web_search"));
        data.insert("summary".into(), json!(digest.summary));
        data.insert("topic_tags".into(), json!(digest.topic_tags));
        data.insert("user_id".into(), json!(user_id.to_string()));
        if let Some(tenant) = &task.tenant_id {
            data.insert("tenant_id".into(), json!(tenant));
        }
        let stored = repo.upsert(data).await?;

        // Post-flight: one search consumed, plus the model tokens.
        let plan = ctx.queue.plan_cache().get_user_plan(&ctx.db, user_id).await?;
        let _ = increment_usage(&ctx.db, user_id, "news_searches_daily", 1, &plan).await;

        info!(%user_id, moment = %stored["name"], tokens = run.total_tokens, "news digest saved");
        Ok(json!({
            "status": "ok",
            "moment_name": stored["name"],
            "io_tokens": run.total_tokens,
        }))
    }
}

/// Interests come from the user's metadata (`interests` array), falling back
/// to their tags.
async fn load_interests(ctx: &WorkerContext, user_id: Uuid) -> anyhow::Result<Vec<String>> {
    let row = sqlx::query("SELECT metadata, tags FROM users WHERE id = $1 AND deleted_at IS NULL")
        .bind(user_id)
        .fetch_optional(ctx.db.pool())
        .await?;
    let Some(row) = row else { return Ok(Vec::new()) };

    let metadata: Value = row.get("metadata");
    let mut interests: Vec<String> = metadata["interests"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if interests.is_empty() {
        interests = row.get::<Vec<String>, _>("tags");
    }
    Ok(interests)
}
