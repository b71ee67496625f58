//! The dreaming handler: consolidate a user's recent activity into linked
//! dream moments.
//!
//! Two independent phases:
//!
//! 1. **SQL consolidation** — `rem_build_moment` collapses over-threshold
//!    sessions into `session_chunk` moments. No model calls.
//! 2. **Model dreaming** — load a bounded context window, run the dreamer
//!    agent(s), persist structured dream moments with bidirectional graph
//!    edges, store the full message trace, and account token usage.
//!
//! Phase 2 failures are caught and reported in the result; Phase 1 output
//! still reaches the caller.

mod context;
mod persist;

pub use context::{ContextStats, load_dreaming_context};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::Row;
use tracing::{error, info, warn};
use uuid::Uuid;

use p8_llm::{Agent, AgentConfig, OutputError, ToolDef, structured_output};
use p8_queue::{Task, TaskHandler, WorkerContext};
use p8_store::Repository;
use p8_store::usage::increment_usage;

const DEFAULT_LOOKBACK_DAYS: i64 = 1;
const DEFAULT_DREAMER_AGENT: &str = "dreaming-agent";
const PHASE1_SESSION_LIMIT: i64 = 10;

/// One edge fragment in the agent's structured output.
#[derive(Debug, Clone, Deserialize)]
pub struct AffinityFragment {
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_relation")]
    pub relation: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_relation() -> String {
    "dream_affinity".to_string()
}

fn default_weight() -> f64 {
    0.5
}

/// One dream in the agent's structured output.
#[derive(Debug, Clone, Deserialize)]
pub struct DreamMoment {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub topic_tags: Vec<String>,
    #[serde(default)]
    pub emotion_tags: Vec<String>,
    #[serde(default)]
    pub affinity_fragments: Vec<AffinityFragment>,
}

#[derive(Debug, Default, Deserialize)]
struct DreamOutput {
    #[serde(default)]
    dream_moments: Vec<DreamMoment>,
}

pub struct DreamingHandler;

#[async_trait]
impl TaskHandler for DreamingHandler {
    async fn handle(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<Value> {
        let payload = task.payload_object();
        let user_id = payload["user_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .or(task.user_id);
        let Some(user_id) = user_id else {
            return Ok(json!({ "io_tokens": 0, "status": "skipped_no_user" }));
        };

        let tenant_id = payload["tenant_id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| task.tenant_id.clone());
        let lookback_days = payload["lookback_days"].as_i64().unwrap_or(DEFAULT_LOOKBACK_DAYS);

        info!(%user_id, lookback_days, "dreaming started");

        let phase1 = self
            .build_session_moments(user_id, tenant_id.as_deref(), ctx)
            .await?;

        let phase2 = match self
            .run_dreaming_agents(user_id, tenant_id.as_deref(), lookback_days, ctx)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(%user_id, error = %e, "dreaming agent failed");
                json!({ "status": "error", "error": e.to_string(), "io_tokens": 0 })
            }
        };

        let phase2_io = phase2["io_tokens"].as_i64().unwrap_or(0);
        let total = phase1["io_tokens"].as_i64().unwrap_or(0) + phase2_io;
        info!(
            %user_id,
            phase1_status = %phase1["status"],
            phase2_status = %phase2["status"],
            tokens = total,
            "dreaming complete"
        );

        // Post-flight: only Phase 2 spends real API tokens; Phase 1 counts are
        // text estimates from the SQL chunker.
        if phase2_io > 0 {
            let plan = ctx.queue.plan_cache().get_user_plan(&ctx.db, user_id).await?;
            if let Err(e) =
                increment_usage(&ctx.db, user_id, "dreaming_io_tokens", phase2_io, &plan).await
            {
                warn!(%user_id, error = %e, "failed to record dreaming usage");
            }
        }

        Ok(json!({ "io_tokens": total, "phase1": phase1, "phase2": phase2 }))
    }
}

impl DreamingHandler {
    // ── Phase 1 — session chunk moments ───────────────────────────────────────

    async fn build_session_moments(
        &self,
        user_id: Uuid,
        tenant_id: Option<&str>,
        ctx: &WorkerContext,
    ) -> anyhow::Result<Value> {
        let sessions = sqlx::query(
            "SELECT s.id FROM sessions s \
             WHERE s.user_id = $1 AND s.deleted_at IS NULL \
             ORDER BY s.updated_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(PHASE1_SESSION_LIMIT)
        .fetch_all(ctx.db.pool())
        .await?;

        let threshold = ctx.settings.memory.moment_token_threshold;
        let mut moments_built = 0;
        let mut io_tokens: i64 = 0;

        for session in &sessions {
            let session_id: Uuid = session.get("id");
            if let Some(built) = ctx
                .db
                .rem_build_moment(session_id, tenant_id, Some(user_id), threshold)
                .await?
            {
                moments_built += 1;
                io_tokens += built.token_count;
            }
        }

        Ok(json!({
            "status": "ok",
            "io_tokens": io_tokens,
            "moments_built": moments_built,
            "sessions_checked": sessions.len(),
        }))
    }

    // ── Phase 2 — model dreaming ──────────────────────────────────────────────

    async fn run_dreaming_agents(
        &self,
        user_id: Uuid,
        tenant_id: Option<&str>,
        lookback_days: i64,
        ctx: &WorkerContext,
    ) -> anyhow::Result<Value> {
        let (context_text, stats) =
            load_dreaming_context(user_id, lookback_days, &ctx.db, &ctx.encryption).await?;
        if context_text.trim().is_empty() {
            return Ok(json!({ "status": "skipped_no_data", "io_tokens": 0 }));
        }

        let dreamers = resolve_dreamer_agents(tenant_id, ctx).await?;

        // One session hosts the full run, across all dreamer agents.
        let session_id = Uuid::new_v4();
        let session_repo = Repository::for_table(
            ctx.db.clone(),
            "sessions",
            std::sync::Arc::clone(&ctx.encryption),
        )?;
        let mut session = serde_json::Map::new();
        session.insert("id".into(), json!(session_id.to_string()));
        session.insert("name".into(), json!(format!("dreaming-{user_id}")));
        session.insert("mode".into(), json!("dreaming"));
        session.insert("agent_name".into(), json!(dreamers[0].name.clone()));
        session.insert("user_id".into(), json!(user_id.to_string()));
        if let Some(tenant) = tenant_id {
            session.insert("tenant_id".into(), json!(tenant));
        }
        session_repo.upsert(session).await?;

        let prompt = format!(
            "## Recent Activity (last {lookback_days} day(s))\n\n{context_text}\n\n\
             Reflect on this shared activity. Use first-order dreaming to \
             consolidate themes, then second-order dreaming to search for \
             semantic connections across the full knowledge base. \
             Reply with a json object: {{\"dream_moments\": [{{\"name\": ..., \
             \"summary\": ..., \"topic_tags\": [...], \"emotion_tags\": [...], \
             \"affinity_fragments\": [{{\"target\": ..., \"relation\": ..., \
             \"weight\": ..., \"reason\": ...}}]}}]}}."
        );

        let mut io_tokens: i64 = 0;
        let mut moments_saved = 0;

        for dreamer in &dreamers {
            let agent = Agent::new(ctx.llm.clone(), dreamer.to_agent_config(ctx))
                .with_tools(vec![memory_search_tool(ctx, tenant_id, user_id)]);
            let run = agent.run(&prompt).await?;
            io_tokens += run.total_tokens;

            // The error tells apart "ignored the output instructions" from
            // "produced the wrong fields" — both degrade to an empty dream.
            let output = match structured_output::<DreamOutput>(&run.output) {
                Ok(output) => output,
                Err(OutputError::NoPayload) => {
                    warn!(agent = %dreamer.name, "dreamer reply carried no structured payload");
                    DreamOutput::default()
                }
                Err(error) => {
                    warn!(agent = %dreamer.name, %error, "dreamer structured output rejected");
                    DreamOutput::default()
                }
            };
            if output.dream_moments.is_empty() {
                warn!(agent = %dreamer.name, "dreamer returned no structured moments");
            } else {
                moments_saved += persist::persist_dream_moments(
                    &output.dream_moments,
                    user_id,
                    tenant_id,
                    session_id,
                    ctx,
                )
                .await?;
            }

            persist::persist_agent_messages(
                session_id,
                &run.trace,
                user_id,
                tenant_id,
                &dreamer.model(ctx),
                &dreamer.name,
                ctx,
            )
            .await?;
        }

        Ok(json!({
            "status": "ok",
            "io_tokens": io_tokens,
            "session_id": session_id.to_string(),
            "moments_saved": moments_saved,
            "context_stats": stats,
        }))
    }
}

/// A dreamer agent resolved from the schemas registry.
#[derive(Debug, Clone)]
struct DreamerAgent {
    name: String,
    schema: Value,
}

impl DreamerAgent {
    fn model(&self, ctx: &WorkerContext) -> String {
        self.schema["model"]
            .as_str()
            .unwrap_or(&ctx.settings.llm.default_model)
            .to_string()
    }

    fn to_agent_config(&self, ctx: &WorkerContext) -> AgentConfig {
        let limits = &self.schema["limits"];
        AgentConfig {
            model: self.model(ctx),
            instructions: self.schema["instructions"]
                .as_str()
                .unwrap_or("Consolidate the user's recent activity into dream moments.")
                .to_string(),
            request_limit: limits["request_limit"]
                .as_u64()
                .map(|v| v as u32)
                .unwrap_or(ctx.settings.llm.default_request_limit),
            token_limit: limits["token_limit"]
                .as_i64()
                .unwrap_or(ctx.settings.llm.default_token_limit as i64),
            temperature: ctx.settings.llm.default_temperature,
            max_tokens: ctx.settings.llm.default_max_tokens,
        }
    }
}

/// Tenants can pin their own dreamers via `metadata.dreamer_agents`; the
/// default is the built-in dreaming agent.
async fn resolve_dreamer_agents(
    tenant_id: Option<&str>,
    ctx: &WorkerContext,
) -> anyhow::Result<Vec<DreamerAgent>> {
    let mut names: Vec<String> = Vec::new();

    if let Some(tenant_id) = tenant_id {
        let row = sqlx::query(
            "SELECT metadata FROM tenants \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(p8_store::deterministic_id("tenants", tenant_id))
        .fetch_optional(ctx.db.pool())
        .await?;
        if let Some(row) = row {
            let metadata: Value = row.get("metadata");
            if let Some(list) = metadata["dreamer_agents"].as_array() {
                names = list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
        }
    }
    if names.is_empty() {
        names.push(DEFAULT_DREAMER_AGENT.to_string());
    }

    let mut agents = Vec::with_capacity(names.len());
    for name in names {
        let row = sqlx::query(
            "SELECT json_schema FROM schemas \
             WHERE name = $1 AND kind = 'agent' AND deleted_at IS NULL",
        )
        .bind(&name)
        .fetch_optional(ctx.db.pool())
        .await?;
        let schema = row
            .map(|r| r.get::<Value, _>("json_schema"))
            .unwrap_or_else(|| json!({}));
        agents.push(DreamerAgent { name, schema });
    }
    Ok(agents)
}

/// Second-order dreaming: fuzzy search over the whole KV index so the agent
/// can connect recent activity to older memories.
fn memory_search_tool(ctx: &WorkerContext, tenant_id: Option<&str>, user_id: Uuid) -> ToolDef {
    let db = ctx.db.clone();
    let tenant = tenant_id.map(str::to_string);
    ToolDef::new(
        "search_memory",
        "Fuzzy-search the knowledge base by text. Returns entity keys with summaries.",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "text to search for"},
                "limit": {"type": "integer", "default": 10}
            },
            "required": ["query"]
        }),
        move |args| {
            let db = db.clone();
            let tenant = tenant.clone();
            async move {
                let query = args["query"].as_str().unwrap_or_default().to_string();
                let limit = args["limit"].as_i64().unwrap_or(10);
                let hits = db
                    .rem_fuzzy(&query, tenant.as_deref(), Some(user_id), 0.3, limit)
                    .await?;
                Ok(json!(hits))
            }
        },
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dream_output_parses_from_model_reply() {
        let raw = r#"Here are the dreams.
```json
{"dream_moments": [{
    "name": "coffee-ritual",
    "summary": "A recurring morning espresso theme.",
    "topic_tags": ["coffee"],
    "emotion_tags": ["calm"],
    "affinity_fragments": [
        {"target": "espresso-notes", "relation": "draws_on", "weight": 0.8, "reason": "same ritual"}
    ]
}]}
```"#;
        let parsed: DreamOutput = structured_output(raw).unwrap();
        assert_eq!(parsed.dream_moments.len(), 1);
        let dm = &parsed.dream_moments[0];
        assert_eq!(dm.name, "coffee-ritual");
        assert_eq!(dm.affinity_fragments[0].target, "espresso-notes");
        assert_eq!(dm.affinity_fragments[0].weight, 0.8);
    }

    #[test]
    fn affinity_fragment_defaults() {
        let fragment: AffinityFragment =
            serde_json::from_value(json!({"target": "x"})).unwrap();
        assert_eq!(fragment.relation, "dream_affinity");
        assert_eq!(fragment.weight, 0.5);
        assert!(fragment.reason.is_none());
    }

    #[test]
    fn replies_without_payload_are_a_distinct_failure() {
        assert!(matches!(
            structured_output::<DreamOutput>("no json at all"),
            Err(OutputError::NoPayload)
        ));
        // Wrong fields still deserialize (every field defaults), so the
        // pipeline degrades to an empty dream rather than an error.
        let parsed: DreamOutput = structured_output(r#"{"unexpected": true}"#).unwrap();
        assert!(parsed.dream_moments.is_empty());
    }
}
