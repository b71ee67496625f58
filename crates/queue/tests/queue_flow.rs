//! Task queue integration tests. Need a real database; set
//! `P8_TEST_DATABASE_URL` and run with `cargo test -- --ignored`.

use chrono::Utc;
use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

use p8_queue::{QueueService, Tier};
use p8_store::Db;

async fn test_db() -> Option<Db> {
    let url = std::env::var("P8_TEST_DATABASE_URL").ok()?;
    let db = Db::connect(&url, 1, 4).await.expect("test database reachable");
    db.migrate().await.expect("migrations apply");
    Some(db)
}

fn unique_type(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn claim_is_ordered_and_disjoint() {
    let Some(db) = test_db().await else { return };
    let queue = QueueService::new(db.clone());
    let task_type = unique_type("claim-test");

    // Three tasks: one high-priority, two normal.
    let low_a = queue
        .enqueue(&task_type, json!({}), Tier::Micro, None, None, 0, None, 3)
        .await
        .unwrap();
    let high = queue
        .enqueue(&task_type, json!({}), Tier::Micro, None, None, 10, None, 3)
        .await
        .unwrap();
    let low_b = queue
        .enqueue(&task_type, json!({}), Tier::Micro, None, None, 0, None, 3)
        .await
        .unwrap();

    // Priority DESC first, then scheduled_at ASC.
    let first = queue.claim(Tier::Micro, "w1", 1).await.unwrap();
    assert_eq!(first[0].id, high);

    // Two workers claiming concurrently never overlap (SKIP LOCKED).
    let (left, right) = tokio::join!(
        queue.claim(Tier::Micro, "w2", 2),
        queue.claim(Tier::Micro, "w3", 2),
    );
    let mut claimed: Vec<Uuid> = left
        .unwrap()
        .into_iter()
        .chain(right.unwrap())
        .map(|t| t.id)
        .collect();
    claimed.sort_unstable();
    claimed.dedup();
    assert_eq!(claimed.len(), 2, "each remaining task claimed exactly once");
    assert!(claimed.contains(&low_a) && claimed.contains(&low_b));

    // Cleanup.
    for id in [low_a, high, low_b] {
        queue.complete(id, None).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn retry_backoff_grows_then_fails_terminally() {
    let Some(db) = test_db().await else { return };
    let queue = QueueService::new(db.clone());
    let task_type = unique_type("retry-test");

    let task_id = queue
        .enqueue(&task_type, json!({}), Tier::Large, None, None, 0, None, 2)
        .await
        .unwrap();

    async fn snapshot(db: &Db, id: Uuid) -> (String, i32, chrono::DateTime<Utc>) {
        let row = sqlx::query(
            "SELECT status, retry_count, scheduled_at FROM task_queue WHERE id = $1",
        )
        .bind(id)
        .fetch_one(db.pool())
        .await
        .unwrap();
        (row.get("status"), row.get("retry_count"), row.get("scheduled_at"))
    }

    // First failure: retry in ~30s.
    queue.fail(task_id, "timeout").await.unwrap();
    let (status, retries, scheduled) = snapshot(&db, task_id).await;
    assert_eq!(status, "pending");
    assert_eq!(retries, 1);
    let delay = (scheduled - Utc::now()).num_seconds();
    assert!((25..=35).contains(&delay), "first backoff ~30s, got {delay}s");

    // Second failure: retry in ~2 minutes.
    queue.fail(task_id, "timeout").await.unwrap();
    let (status, retries, scheduled) = snapshot(&db, task_id).await;
    assert_eq!(status, "pending");
    assert_eq!(retries, 2);
    let delay = (scheduled - Utc::now()).num_seconds();
    assert!((110..=130).contains(&delay), "second backoff ~120s, got {delay}s");

    // Third failure: terminal. Counter stops at max_retries.
    queue.fail(task_id, "timeout").await.unwrap();
    let (status, retries, _) = snapshot(&db, task_id).await;
    assert_eq!(status, "failed");
    assert_eq!(retries, 2);

    // Events were recorded along the way.
    let events = sqlx::query(
        "SELECT event FROM task_events WHERE task_id = $1 ORDER BY id",
    )
    .bind(task_id)
    .fetch_all(db.pool())
    .await
    .unwrap();
    let kinds: Vec<String> = events.iter().map(|r| r.get("event")).collect();
    assert_eq!(kinds, ["retry", "retry", "failed"]);
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn stale_processing_tasks_recover() {
    let Some(db) = test_db().await else { return };
    let queue = QueueService::new(db.clone());
    let task_type = unique_type("stale-test");

    let task_id = queue
        .enqueue(&task_type, json!({}), Tier::Medium, None, None, 0, None, 3)
        .await
        .unwrap();
    let claimed = queue.claim(Tier::Medium, "crasher", 1).await.unwrap();
    assert_eq!(claimed[0].id, task_id);

    // Simulate a worker that died twenty minutes ago.
    sqlx::query(
        "UPDATE task_queue SET claimed_at = CURRENT_TIMESTAMP - interval '20 minutes' \
         WHERE id = $1",
    )
    .bind(task_id)
    .execute(db.pool())
    .await
    .unwrap();

    let recovered = db.recover_stale_tasks(15).await.unwrap();
    assert!(recovered >= 1);

    let row = sqlx::query("SELECT status, claimed_by FROM task_queue WHERE id = $1")
        .bind(task_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "pending");
    assert!(row.get::<Option<String>, _>("claimed_by").is_none());

    queue.complete(task_id, None).await.unwrap();
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn dreaming_enqueue_skips_users_with_pending_tasks() {
    let Some(db) = test_db().await else { return };

    // A fresh active user with no dreaming task.
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, name, tenant_id) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(format!("dreamer-{}", user_id.simple()))
        .bind(format!("tenant-{}", user_id.simple()))
        .execute(db.pool())
        .await
        .unwrap();

    async fn count_for(db: &Db, user_id: Uuid) -> i64 {
        sqlx::query(
            "SELECT COUNT(*)::bigint AS cnt FROM task_queue \
             WHERE task_type = 'dreaming' AND user_id = $1 \
               AND status IN ('pending', 'processing')",
        )
        .bind(user_id)
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("cnt")
    }

    sqlx::query("SELECT enqueue_dreaming_tasks()")
        .execute(db.pool())
        .await
        .unwrap();
    assert_eq!(count_for(&db, user_id).await, 1);

    // Idempotent: a second enqueue pass adds nothing for this user.
    sqlx::query("SELECT enqueue_dreaming_tasks()")
        .execute(db.pool())
        .await
        .unwrap();
    assert_eq!(count_for(&db, user_id).await, 1);
}
