//! Queue service: enqueue, claim, complete, fail, events, introspection.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use p8_store::Db;
use p8_store::usage::{PlanCache, check_quota};

use crate::{Result, Task, Tier};

pub struct QueueService {
    db: Db,
    plan_cache: PlanCache,
}

impl QueueService {
    pub fn new(db: Db) -> Self {
        Self { db, plan_cache: PlanCache::new() }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Enqueue a new task. Returns the task id.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: Value,
        tier: Tier,
        user_id: Option<Uuid>,
        tenant_id: Option<&str>,
        priority: i32,
        scheduled_at: Option<DateTime<Utc>>,
        max_retries: i32,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            "INSERT INTO task_queue \
             (task_type, tier, user_id, tenant_id, payload, priority, scheduled_at, max_retries) \
             VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, CURRENT_TIMESTAMP), $8) \
             RETURNING id",
        )
        .bind(task_type)
        .bind(tier.as_str())
        .bind(user_id)
        .bind(tenant_id)
        .bind(&payload)
        .bind(priority)
        .bind(scheduled_at)
        .bind(max_retries)
        .fetch_one(self.db.pool())
        .await?;
        let task_id: Uuid = row.get("id");
        info!(task_type, %task_id, tier = %tier, "task enqueued");
        Ok(task_id)
    }

    /// Enqueue file processing; the SQL function derives the tier from size.
    pub async fn enqueue_file(
        &self,
        file_id: Uuid,
        user_id: Option<Uuid>,
        tenant_id: Option<&str>,
    ) -> Result<Uuid> {
        let row = sqlx::query("SELECT enqueue_file_task($1, $2, $3) AS id")
            .bind(file_id)
            .bind(user_id)
            .bind(tenant_id)
            .fetch_one(self.db.pool())
            .await?;
        let task_id: Uuid = row.get("id");
        info!(%task_id, %file_id, "file_processing task enqueued");
        Ok(task_id)
    }

    /// Claim a batch of pending tasks for a tier. Concurrent claims on the
    /// same tier return disjoint sets.
    pub async fn claim(&self, tier: Tier, worker_id: &str, batch_size: i32) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>("SELECT * FROM claim_tasks($1, $2, $3)")
            .bind(tier.as_str())
            .bind(worker_id)
            .bind(batch_size)
            .fetch_all(self.db.pool())
            .await?;
        if !tasks.is_empty() {
            info!(
                worker_id,
                tier = %tier,
                count = tasks.len(),
                "tasks claimed"
            );
        }
        Ok(tasks)
    }

    pub async fn complete(&self, task_id: Uuid, result: Option<Value>) -> Result<()> {
        sqlx::query("SELECT complete_task($1, $2)")
            .bind(task_id)
            .bind(result)
            .execute(self.db.pool())
            .await?;
        info!(%task_id, "task completed");
        Ok(())
    }

    /// Mark a task failed. The SQL function applies the retry/backoff policy.
    pub async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        sqlx::query("SELECT fail_task($1, $2)")
            .bind(task_id)
            .bind(error)
            .execute(self.db.pool())
            .await?;
        warn!(%task_id, error = %error.chars().take(200).collect::<String>(), "task failed");
        Ok(())
    }

    pub async fn emit_event(
        &self,
        task_id: Uuid,
        event: &str,
        worker_id: Option<&str>,
        error: Option<&str>,
        detail: Option<Value>,
    ) -> Result<()> {
        sqlx::query("SELECT emit_task_event($1, $2, $3, $4, $5)")
            .bind(task_id)
            .bind(event)
            .bind(worker_id)
            .bind(error)
            .bind(detail)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    // ── Quotas ────────────────────────────────────────────────────────────────

    /// Map a task type to the resource its pre-flight quota check covers.
    pub fn quota_resource(task_type: &str) -> Option<&'static str> {
        match task_type {
            "file_processing" => Some("storage_bytes"),
            "dreaming" => Some("dreaming_minutes"),
            "news" => Some("news_searches_daily"),
            "drive_sync" => Some("drive_syncs_daily"),
            _ => None,
        }
    }

    /// Pre-flight quota check. System tasks (no user) always pass. When a
    /// quota is exceeded a `quota_exceeded` event is emitted and the task
    /// must be failed without retry.
    pub async fn check_task_quota(&self, task: &Task) -> Result<bool> {
        let Some(user_id) = task.user_id else { return Ok(true) };
        let Some(resource) = Self::quota_resource(&task.task_type) else {
            return Ok(true);
        };

        let plan_id = self.plan_cache.get_user_plan(&self.db, user_id).await?;
        let status = check_quota(&self.db, user_id, resource, &plan_id).await?;
        if status.exceeded {
            self.emit_event(
                task.id,
                "quota_exceeded",
                None,
                Some(&format!(
                    "{resource} quota exceeded (used={}, limit={})",
                    status.used, status.limit
                )),
                Some(json!({
                    "quota": resource,
                    "used": status.used,
                    "limit": status.limit,
                    "plan": plan_id,
                })),
            )
            .await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plan_cache
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// `{tier}/{status}` → count across the queue.
    pub async fn stats(&self) -> Result<Value> {
        let rows = sqlx::query(
            "SELECT tier, status, COUNT(*)::bigint AS count \
             FROM task_queue GROUP BY tier, status ORDER BY tier, status",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut out = serde_json::Map::new();
        for row in rows {
            let key = format!("{}/{}", row.get::<String, _>("tier"), row.get::<String, _>("status"));
            out.insert(key, json!(row.get::<i64, _>("count")));
        }
        Ok(Value::Object(out))
    }

    pub async fn status_counts(&self) -> Result<Value> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*)::bigint AS cnt \
             FROM task_queue GROUP BY status ORDER BY status",
        )
        .fetch_all(self.db.pool())
        .await?;
        let mut out = serde_json::Map::new();
        for row in rows {
            out.insert(row.get::<String, _>("status"), json!(row.get::<i64, _>("cnt")));
        }
        Ok(Value::Object(out))
    }

    /// Queue summary grouped by task_type for one status, newest error last.
    pub async fn summary_by_type(&self, status: &str) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT tq.task_type, COUNT(*)::bigint AS cnt, \
                    ARRAY_AGG(DISTINCT tq.tenant_id) \
                        FILTER (WHERE tq.tenant_id IS NOT NULL) AS tenant_ids, \
                    MIN(tq.scheduled_at) AS earliest, \
                    MAX(tq.scheduled_at) AS latest, \
                    MAX(tq.error) AS last_error \
               FROM task_queue tq \
              WHERE tq.status = $1 \
              GROUP BY tq.task_type \
              ORDER BY cnt DESC",
        )
        .bind(status)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "task_type": r.get::<String, _>("task_type"),
                    "count": r.get::<i64, _>("cnt"),
                    "tenant_ids": r.get::<Option<Vec<String>>, _>("tenant_ids"),
                    "earliest": r.get::<Option<DateTime<Utc>>, _>("earliest"),
                    "latest": r.get::<Option<DateTime<Utc>>, _>("latest"),
                    "last_error": r.get::<Option<String>, _>("last_error"),
                })
            })
            .collect())
    }

    /// Last completed + next pending per (task_type, tenant). Every active
    /// tenant appears even without task history.
    pub async fn task_schedule(&self) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT t.task_type, u.tenant_id, \
                    MAX(tq.completed_at) FILTER (WHERE tq.status = 'completed') AS last_completed, \
                    MIN(tq.scheduled_at) FILTER (WHERE tq.status = 'pending') AS next_pending \
               FROM (VALUES ('dreaming'), ('news'), ('drive_sync')) AS t(task_type) \
              CROSS JOIN (SELECT DISTINCT tenant_id FROM users \
                           WHERE tenant_id IS NOT NULL AND deleted_at IS NULL) u \
               LEFT JOIN task_queue tq \
                 ON tq.task_type = t.task_type AND tq.tenant_id = u.tenant_id \
              GROUP BY t.task_type, u.tenant_id \
              ORDER BY u.tenant_id, t.task_type",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "task_type": r.get::<String, _>("task_type"),
                    "tenant_id": r.get::<String, _>("tenant_id"),
                    "last_completed": r.get::<Option<DateTime<Utc>>, _>("last_completed"),
                    "next_pending": r.get::<Option<DateTime<Utc>>, _>("next_pending"),
                })
            })
            .collect())
    }

    /// Active pg_cron jobs, classified into system jobs and task schedules.
    /// Returns empty sets when pg_cron is not installed.
    pub async fn cron_jobs(&self) -> Result<Value> {
        let rows = match sqlx::query(
            "SELECT jobid, jobname, schedule, command, active FROM cron.job \
             WHERE active = true ORDER BY jobid",
        )
        .fetch_all(self.db.pool())
        .await
        {
            Ok(rows) => rows,
            Err(_) => {
                return Ok(json!({
                    "system": [],
                    "task_schedules": {},
                }));
            }
        };

        let mut system = Vec::new();
        let mut task_schedules = serde_json::Map::new();
        for row in rows {
            let name: String = row.get("jobname");
            let schedule: String = row.get("schedule");
            let command: String = row.get::<Option<String>, _>("command").unwrap_or_default();

            let description = if command.contains("enqueue_news_tasks") {
                task_schedules.insert("news".to_string(), json!(schedule.clone()));
                "Enqueue news digests for all users"
            } else if command.contains("enqueue_dreaming_tasks") {
                task_schedules.insert("dreaming".to_string(), json!(schedule.clone()));
                "Enqueue dreaming for all users"
            } else if command.contains("recover_stale_tasks") {
                "Recover stale/stuck tasks"
            } else {
                &command[..command.len().min(60)]
            };
            system.push(json!({
                "name": name,
                "schedule": schedule,
                "description": description,
            }));
        }

        Ok(json!({
            "system": system,
            "task_schedules": task_schedules,
        }))
    }
}
