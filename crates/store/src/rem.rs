//! Wrappers over the REM SQL functions installed by the migrations.
//!
//! Each wrapper is a thin typed shim: scoping parameters in, JSON rows out.
//! The actual query logic lives in the database so the HTTP surface, the CLI,
//! and the workers all observe identical semantics.

use chrono::{DateTime, NaiveDate, Utc};
use pgvector::Vector;
use serde_json::{Value, json};
use sqlx::Row;
use uuid::Uuid;

use crate::Result;
use crate::pool::Db;

/// One `kv_store` hit joined back to its source row.
#[derive(Debug, Clone)]
pub struct LookupHit {
    pub entity_type: String,
    pub data: Value,
}

impl Db {
    pub async fn rem_lookup(
        &self,
        key: &str,
        tenant_id: Option<&str>,
        user_id: Option<Uuid>,
    ) -> Result<Vec<LookupHit>> {
        let rows = sqlx::query("SELECT * FROM rem_lookup($1, $2, $3)")
            .bind(key)
            .bind(tenant_id)
            .bind(user_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| LookupHit {
                entity_type: r.get("entity_type"),
                data: r.get("data"),
            })
            .collect())
    }

    pub async fn rem_fuzzy(
        &self,
        query: &str,
        tenant_id: Option<&str>,
        user_id: Option<Uuid>,
        threshold: f64,
        limit: i64,
    ) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT * FROM rem_fuzzy($1, $2, $3, $4, $5)")
            .bind(query)
            .bind(tenant_id)
            .bind(threshold)
            .bind(limit)
            .bind(user_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "entity_key": r.get::<String, _>("entity_key"),
                    "entity_type": r.get::<String, _>("entity_type"),
                    "entity_id": r.get::<Uuid, _>("entity_id").to_string(),
                    "content_summary": r.get::<Option<String>, _>("content_summary"),
                    "similarity": r.get::<f64, _>("similarity"),
                })
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn rem_search(
        &self,
        embedding: &[f32],
        table: &str,
        field: &str,
        tenant_id: Option<&str>,
        provider: &str,
        min_similarity: f64,
        limit: i64,
        user_id: Option<Uuid>,
    ) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT * FROM rem_search($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(Vector::from(embedding.to_vec()))
            .bind(table)
            .bind(field)
            .bind(tenant_id)
            .bind(provider)
            .bind(min_similarity)
            .bind(limit)
            .bind(user_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let mut data: Value = r.get("data");
                if let Value::Object(map) = &mut data {
                    map.insert("similarity".to_string(), json!(r.get::<f64, _>("similarity")));
                }
                data
            })
            .collect())
    }

    pub async fn rem_traverse(
        &self,
        start_key: &str,
        tenant_id: Option<&str>,
        user_id: Option<Uuid>,
        max_depth: i64,
        rel_type: Option<&str>,
    ) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT * FROM rem_traverse($1, $2, $3, $4, $5)")
            .bind(start_key)
            .bind(tenant_id)
            .bind(user_id)
            .bind(max_depth)
            .bind(rel_type)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "depth": r.get::<i32, _>("depth"),
                    "entity_key": r.get::<String, _>("entity_key"),
                    "entity_type": r.get::<String, _>("entity_type"),
                    "entity_id": r.get::<Uuid, _>("entity_id").to_string(),
                    "relation": r.get::<Option<String>, _>("relation"),
                    "weight": r.get::<Option<f64>, _>("weight"),
                    "content_summary": r.get::<Option<String>, _>("content_summary"),
                })
            })
            .collect())
    }

    /// Cursor-paginated moments timeline. `before_date` is a UTC calendar
    /// date; pass `None` for the first page.
    pub async fn rem_moments_feed(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
        before_date: Option<NaiveDate>,
    ) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT * FROM rem_moments_feed($1, $2, $3)")
            .bind(user_id)
            .bind(limit)
            .bind(before_date)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<Value, _>("data")).collect())
    }

    /// Chronologically ordered messages; the tightest of the three bounds
    /// wins when several are given.
    pub async fn rem_load_messages(
        &self,
        session_id: Uuid,
        max_tokens: Option<i64>,
        max_messages: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT * FROM rem_load_messages($1, $2, $3, $4)")
            .bind(session_id)
            .bind(max_tokens)
            .bind(max_messages)
            .bind(since)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<Value, _>("data")).collect())
    }

    /// Collapse accumulated messages into a `session_chunk` moment when the
    /// session holds more than `threshold` tokens since its last chunk.
    /// SQL only — no model calls. Returns `None` below the threshold.
    pub async fn rem_build_moment(
        &self,
        session_id: Uuid,
        tenant_id: Option<&str>,
        user_id: Option<Uuid>,
        threshold: i64,
    ) -> Result<Option<BuiltMoment>> {
        let row = sqlx::query("SELECT * FROM rem_build_moment($1, $2, $3, $4)")
            .bind(session_id)
            .bind(tenant_id)
            .bind(user_id)
            .bind(threshold)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| {
            let moment_id: Option<Uuid> = r.get("moment_id");
            moment_id.map(|id| BuiltMoment {
                moment_id: id,
                moment_name: r.get("moment_name"),
                message_count: r.get("message_count"),
                token_count: r.get("token_count"),
            })
        }))
    }

    /// Persist a user+assistant turn atomically, optionally chunking into a
    /// moment in the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn rem_persist_turn(
        &self,
        session_id: Uuid,
        user_content: &str,
        assistant_content: &str,
        user_id: Option<Uuid>,
        tenant_id: Option<&str>,
        tool_calls: Option<&Value>,
        pai_messages: Option<&Value>,
        moment_threshold: i64,
    ) -> Result<Value> {
        let row = sqlx::query("SELECT * FROM rem_persist_turn($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(session_id)
            .bind(user_content)
            .bind(assistant_content)
            .bind(user_id)
            .bind(tenant_id)
            .bind(tool_calls)
            .bind(pai_messages)
            .bind(moment_threshold)
            .fetch_optional(self.pool())
            .await?;
        Ok(row
            .map(|r| {
                json!({
                    "user_message_id": r.get::<Uuid, _>("user_message_id").to_string(),
                    "assistant_message_id": r.get::<Uuid, _>("assistant_message_id").to_string(),
                    "moment_name": r.get::<Option<String>, _>("moment_name"),
                })
            })
            .unwrap_or(Value::Null))
    }

    /// Copy a session and its last N messages under fresh ids.
    pub async fn clone_session(
        &self,
        source_session_id: Uuid,
        max_messages: Option<i64>,
        new_user_id: Option<Uuid>,
        new_agent_name: Option<&str>,
    ) -> Result<(Uuid, i64)> {
        let row = sqlx::query("SELECT * FROM clone_session($1, $2, $3, $4)")
            .bind(source_session_id)
            .bind(max_messages)
            .bind(new_user_id)
            .bind(new_agent_name)
            .fetch_one(self.pool())
            .await?;
        Ok((row.get("new_session_id"), row.get("messages_copied")))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn search_sessions(
        &self,
        query: Option<&str>,
        user_id: Option<Uuid>,
        agent_name: Option<&str>,
        tags: Option<&[String]>,
        tenant_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        page: i64,
        page_size: i64,
    ) -> Result<Value> {
        let rows = sqlx::query("SELECT * FROM search_sessions($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(query)
            .bind(user_id)
            .bind(agent_name)
            .bind(tags.map(|t| t.to_vec()))
            .bind(tenant_id)
            .bind(since)
            .bind(page)
            .bind(page_size)
            .fetch_all(self.pool())
            .await?;

        let total = rows
            .first()
            .map(|r| r.get::<i64, _>("total_results"))
            .unwrap_or(0);
        let results: Vec<Value> = rows.into_iter().map(|r| r.get::<Value, _>("data")).collect();
        Ok(json!({
            "results": results,
            "total": total,
            "page": page,
            "page_size": page_size,
        }))
    }

    pub async fn rem_session_timeline(&self, session_id: Uuid, limit: i64) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT * FROM rem_session_timeline($1, $2)")
            .bind(session_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<Value, _>("data")).collect())
    }

    /// Reset tasks stuck in `processing` longer than `stale_minutes` back to
    /// `pending`. Returns the number of recovered rows.
    pub async fn recover_stale_tasks(&self, stale_minutes: i64) -> Result<i64> {
        let row = sqlx::query("SELECT recover_stale_tasks($1) AS recovered")
            .bind(stale_minutes as i32)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get::<i32, _>("recovered") as i64)
    }

    /// Run validated raw SQL from dialect SQL mode. SELECT-shaped statements
    /// come back as JSON rows; writes report `rows_affected`.
    pub async fn fetch_raw_json(&self, sql: &str) -> Result<Vec<Value>> {
        let head = sql.trim_start().to_uppercase();
        if head.starts_with("SELECT") || head.starts_with("WITH") {
            let wrapped =
                format!("SELECT coalesce(jsonb_agg(to_jsonb(t)), '[]'::jsonb) AS rows FROM ({sql}) t");
            let row = sqlx::query(&wrapped).fetch_one(self.pool()).await?;
            let rows: Value = row.get("rows");
            match rows {
                Value::Array(items) => Ok(items),
                other => Ok(vec![other]),
            }
        } else {
            let result = sqlx::query(sql).execute(self.pool()).await?;
            Ok(vec![json!({ "rows_affected": result.rows_affected() })])
        }
    }
}

impl LookupHit {
    pub fn to_value(&self) -> Value {
        json!({ "entity_type": self.entity_type, "data": self.data })
    }
}

#[derive(Debug, Clone)]
pub struct BuiltMoment {
    pub moment_id: Uuid,
    pub moment_name: String,
    pub message_count: i64,
    pub token_count: i64,
}

impl BuiltMoment {
    pub fn to_value(&self) -> Value {
        json!({
            "moment_id": self.moment_id.to_string(),
            "moment_name": self.moment_name,
            "message_count": self.message_count,
            "token_count": self.token_count,
        })
    }
}
