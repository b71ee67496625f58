//! Operator commands: health, queue, quota, enqueue.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

use p8_config::Settings;
use p8_queue::{QueueService, Tier};
use p8_store::Db;
use p8_store::usage::{PlanCache, check_quota};

#[derive(Debug, Subcommand)]
pub enum AdminCommands {
    /// Check database, queue, and scheduler health.
    Health,
    /// Queue status counts and per-type summaries.
    Queue,
    /// Usage and limits for a user.
    Quota {
        user_id: Uuid,
    },
    /// Enqueue a task by hand.
    Enqueue {
        task_type: String,
        #[arg(long, default_value = "small")]
        tier: String,
        #[arg(long)]
        user: Option<Uuid>,
        #[arg(long)]
        tenant: Option<String>,
        /// JSON payload; defaults to `{}`.
        #[arg(long)]
        payload: Option<String>,
    },
}

pub async fn run(settings: Settings, command: AdminCommands) -> Result<()> {
    let db = Db::connect(
        &settings.database.url,
        settings.database.pool_min,
        settings.database.pool_max,
    )
    .await
    .context("connecting to the database")?;
    let queue = QueueService::new(db.clone());

    match command {
        AdminCommands::Health => health(&db, &queue).await,
        AdminCommands::Queue => {
            let overview = json!({
                "stats": queue.stats().await?,
                "status_counts": queue.status_counts().await?,
                "pending": queue.summary_by_type("pending").await?,
                "failed": queue.summary_by_type("failed").await?,
                "cron": queue.cron_jobs().await?,
            });
            println!("{}", serde_json::to_string_pretty(&overview)?);
            Ok(())
        }
        AdminCommands::Quota { user_id } => {
            let plan_cache = PlanCache::new();
            let plan = plan_cache.get_user_plan(&db, user_id).await?;
            let mut report = serde_json::Map::new();
            report.insert("plan_id".into(), json!(plan));
            for resource in [
                "chat_tokens",
                "storage_bytes",
                "dreaming_minutes",
                "dreaming_io_tokens",
                "news_searches_daily",
            ] {
                let status = check_quota(&db, user_id, resource, &plan).await?;
                report.insert(resource.into(), json!(status));
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        AdminCommands::Enqueue { task_type, tier, user, tenant, payload } => {
            let tier = Tier::parse(&tier)
                .ok_or_else(|| anyhow::anyhow!("unknown tier: {tier}"))?;
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("parsing --payload as JSON")?,
                None => json!({}),
            };
            let task_id = queue
                .enqueue(&task_type, payload, tier, user, tenant.as_deref(), 0, None, 3)
                .await?;
            println!("enqueued {task_id}");
            Ok(())
        }
    }
}

async fn health(db: &Db, queue: &QueueService) -> Result<()> {
    let mut failures = 0;

    // Connectivity plus the core extension set.
    match sqlx::query("SELECT 1 AS one").fetch_one(db.pool()).await {
        Ok(_) => println!("database          ok"),
        Err(e) => {
            println!("database          FAILED ({e})");
            failures += 1;
        }
    }

    for (name, probe) in [
        ("vector extension", "SELECT 1 FROM pg_extension WHERE extname = 'vector'"),
        ("pg_trgm extension", "SELECT 1 FROM pg_extension WHERE extname = 'pg_trgm'"),
        ("kv_store table", "SELECT 1 FROM kv_store LIMIT 1"),
        ("task_queue table", "SELECT 1 FROM task_queue LIMIT 1"),
    ] {
        match sqlx::query(probe).fetch_optional(db.pool()).await {
            Ok(_) => println!("{name:<18}ok"),
            Err(e) => {
                println!("{name:<18}FAILED ({e})");
                failures += 1;
            }
        }
    }

    // System tenant key present?
    match sqlx::query("SELECT status FROM tenant_keys WHERE tenant_id = '__system__'")
        .fetch_optional(db.pool())
        .await
    {
        Ok(Some(row)) => println!("system key        ok ({})", row.get::<String, _>("status")),
        Ok(None) => println!("system key        missing (created on first serve)"),
        Err(e) => {
            println!("system key        FAILED ({e})");
            failures += 1;
        }
    }

    // Scheduler jobs, when pg_cron is present.
    let cron = queue.cron_jobs().await?;
    let jobs = cron["system"].as_array().map(|a| a.len()).unwrap_or(0);
    if jobs > 0 {
        println!("cron jobs         ok ({jobs} active)");
    } else {
        println!("cron jobs         none (pg_cron missing or unscheduled)");
    }

    println!("queue             {}", queue.status_counts().await?);

    if failures > 0 {
        bail!("{failures} health check(s) failed");
    }
    Ok(())
}
