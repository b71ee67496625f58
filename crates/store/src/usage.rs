//! Usage tracking: plan limits, quota checks, atomic increments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::Result;
use crate::pool::Db;

const GB: i64 = 1024 * 1024 * 1024;
const MB: i64 = 1024 * 1024;
const PLAN_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub chat_tokens: i64,
    pub storage_bytes: i64,
    pub dreaming_minutes: i64,
    pub cloud_folders: i64,
    pub dreaming_interval_hours: i64,
    pub max_file_size_bytes: i64,
    pub worker_bytes_processed: i64,
    pub dreaming_io_tokens: i64,
    pub news_searches_daily: i64,
    pub drive_syncs_daily: i64,
}

/// Plan table. Unknown plan ids resolve to `free`.
pub fn get_limits(plan_id: &str) -> PlanLimits {
    match plan_id {
        "pro" => PlanLimits {
            chat_tokens: 100_000,
            storage_bytes: 50 * GB,
            dreaming_minutes: 120,
            cloud_folders: 5,
            dreaming_interval_hours: 12,
            max_file_size_bytes: 100 * MB,
            worker_bytes_processed: GB,
            dreaming_io_tokens: 50_000,
            news_searches_daily: 10,
            drive_syncs_daily: 24,
        },
        "team" => PlanLimits {
            chat_tokens: 100_000,
            storage_bytes: 100 * GB,
            dreaming_minutes: 180,
            cloud_folders: 10,
            dreaming_interval_hours: 12,
            max_file_size_bytes: 500 * MB,
            worker_bytes_processed: 5 * GB,
            dreaming_io_tokens: 100_000,
            news_searches_daily: 25,
            drive_syncs_daily: 48,
        },
        "enterprise" => PlanLimits {
            chat_tokens: 250_000,
            storage_bytes: 500 * GB,
            dreaming_minutes: 360,
            cloud_folders: 999,
            dreaming_interval_hours: 6,
            max_file_size_bytes: GB,
            worker_bytes_processed: 50 * GB,
            dreaming_io_tokens: 500_000,
            news_searches_daily: 100,
            drive_syncs_daily: 96,
        },
        _ => PlanLimits {
            chat_tokens: 25_000,
            storage_bytes: 10 * GB,
            dreaming_minutes: 30,
            cloud_folders: 1,
            dreaming_interval_hours: 24,
            max_file_size_bytes: 10 * MB,
            worker_bytes_processed: 100 * MB,
            dreaming_io_tokens: 10_000,
            news_searches_daily: 3,
            drive_syncs_daily: 4,
        },
    }
}

impl PlanLimits {
    pub fn limit_for(&self, resource_type: &str) -> i64 {
        match resource_type {
            "chat_tokens" => self.chat_tokens,
            "storage_bytes" => self.storage_bytes,
            "dreaming_minutes" => self.dreaming_minutes,
            "dreaming_io_tokens" => self.dreaming_io_tokens,
            "worker_bytes_processed" => self.worker_bytes_processed,
            "news_searches_daily" => self.news_searches_daily,
            "drive_syncs_daily" => self.drive_syncs_daily,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotaStatus {
    pub used: i64,
    pub limit: i64,
    pub exceeded: bool,
}

/// Per-process plan cache. Plans change rarely; five minutes of staleness is
/// acceptable for quota purposes.
#[derive(Default)]
pub struct PlanCache {
    entries: Mutex<HashMap<Uuid, (String, Instant)>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_user_plan(&self, db: &Db, user_id: Uuid) -> Result<String> {
        {
            let entries = self.entries.lock().expect("plan cache poisoned");
            if let Some((plan, at)) = entries.get(&user_id) {
                if at.elapsed() < PLAN_CACHE_TTL {
                    return Ok(plan.clone());
                }
            }
        }

        let row = sqlx::query(
            "SELECT plan_id FROM billing_customers \
             WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(db.pool())
        .await?;
        let plan_id = row
            .map(|r| r.get::<String, _>("plan_id"))
            .unwrap_or_else(|| "free".to_string());

        self.entries
            .lock()
            .expect("plan cache poisoned")
            .insert(user_id, (plan_id.clone(), Instant::now()));
        Ok(plan_id)
    }

    pub fn invalidate(&self, user_id: Uuid) {
        self.entries
            .lock()
            .expect("plan cache poisoned")
            .remove(&user_id);
    }
}

/// Check current usage against plan limits without incrementing.
///
/// `storage_bytes` is computed live from the files table; periodic resources
/// read `usage_tracking` for the current period.
pub async fn check_quota(
    db: &Db,
    user_id: Uuid,
    resource_type: &str,
    plan_id: &str,
) -> Result<QuotaStatus> {
    let limits = get_limits(plan_id);

    if resource_type == "storage_bytes" {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(size_bytes), 0)::bigint AS used FROM files \
             WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(db.pool())
        .await?;
        let used: i64 = row.get("used");
        let limit = limits.storage_bytes;
        return Ok(QuotaStatus { used, limit, exceeded: used > limit });
    }

    let period_expr = if resource_type.ends_with("_daily") {
        "CURRENT_DATE"
    } else {
        "date_trunc('month', CURRENT_DATE)::date"
    };
    let sql = format!(
        "SELECT used, granted_extra FROM usage_tracking \
         WHERE user_id = $1 AND resource_type = $2 AND period_start = {period_expr}"
    );
    let row = sqlx::query(&sql)
        .bind(user_id)
        .bind(resource_type)
        .fetch_optional(db.pool())
        .await?;

    let (used, extra) = row
        .map(|r| (r.get::<i64, _>("used"), r.get::<i64, _>("granted_extra")))
        .unwrap_or((0, 0));
    let effective_limit = limits.limit_for(resource_type) + extra;
    Ok(QuotaStatus {
        used,
        limit: effective_limit,
        exceeded: used > effective_limit,
    })
}

/// Atomically increment usage via the `usage_increment` SQL upsert and return
/// the updated status. Monotonic: `new_used >= old_used + amount`.
pub async fn increment_usage(
    db: &Db,
    user_id: Uuid,
    resource_type: &str,
    amount: i64,
    plan_id: &str,
) -> Result<QuotaStatus> {
    let base_limit = get_limits(plan_id).limit_for(resource_type);
    let row = sqlx::query("SELECT * FROM usage_increment($1, $2, $3, $4)")
        .bind(user_id)
        .bind(resource_type)
        .bind(amount)
        .bind(base_limit)
        .fetch_one(db.pool())
        .await?;
    Ok(QuotaStatus {
        used: row.get("new_used"),
        limit: row.get("effective_limit"),
        exceeded: row.get("exceeded"),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plan_defaults_to_free() {
        let free = get_limits("free");
        let unknown = get_limits("definitely-not-a-plan");
        assert_eq!(free.chat_tokens, unknown.chat_tokens);
        assert_eq!(free.storage_bytes, unknown.storage_bytes);
    }

    #[test]
    fn plans_are_strictly_ordered_on_core_limits() {
        let free = get_limits("free");
        let pro = get_limits("pro");
        let team = get_limits("team");
        let enterprise = get_limits("enterprise");
        assert!(free.storage_bytes < pro.storage_bytes);
        assert!(pro.storage_bytes < team.storage_bytes);
        assert!(team.storage_bytes < enterprise.storage_bytes);
        assert!(free.dreaming_io_tokens < pro.dreaming_io_tokens);
    }

    #[test]
    fn limit_for_maps_resource_names() {
        let pro = get_limits("pro");
        assert_eq!(pro.limit_for("chat_tokens"), pro.chat_tokens);
        assert_eq!(pro.limit_for("news_searches_daily"), pro.news_searches_daily);
        assert_eq!(pro.limit_for("unmetered_thing"), 0);
    }
}
