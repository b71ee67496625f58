//! Database-backed integration tests.
//!
//! These run against a real PostgreSQL with the vector/pg_trgm extensions.
//! Set `P8_TEST_DATABASE_URL` and run with `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

use p8_crypto::EncryptionService;
use p8_kms::LocalFileKms;
use p8_store::{Db, Repository, deterministic_id, normalize_key, spec_for};

async fn test_db() -> Option<Db> {
    let url = std::env::var("P8_TEST_DATABASE_URL").ok()?;
    let db = Db::connect(&url, 1, 4).await.expect("test database reachable");
    db.migrate().await.expect("migrations apply");
    Some(db)
}

fn test_encryption(db: &Db) -> Arc<EncryptionService> {
    let keyfile = std::env::temp_dir().join(format!("p8-test-master-{}.key", Uuid::new_v4()));
    let kms = Arc::new(LocalFileKms::new(&keyfile, db.pool().clone()).unwrap());
    Arc::new(EncryptionService::new(kms, "__system__", Duration::from_secs(300)))
}

fn unique(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn schema_upsert_chains_kv_and_embedding_queue() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);
    let repo = Repository::for_table(db.clone(), "schemas", Arc::clone(&encryption)).unwrap();

    let name = unique("chain-test-agent");
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!(name));
    data.insert("kind".into(), json!("agent"));
    data.insert("description".into(), json!("d"));

    // (a) deterministic id, identical across two upserts of the same name.
    let first = repo.upsert(data.clone()).await.unwrap();
    let second = repo.upsert(data).await.unwrap();
    assert_eq!(first["id"], second["id"]);
    assert_eq!(
        first["id"].as_str().unwrap(),
        deterministic_id("schemas", &name).to_string()
    );

    // (b) exactly one kv_store row keyed by the normalized name.
    let key = normalize_key(&name);
    let kv_rows = sqlx::query("SELECT entity_id FROM kv_store WHERE entity_key = $1")
        .bind(&key)
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(kv_rows.len(), 1);
    assert_eq!(
        kv_rows[0].get::<Uuid, _>("entity_id").to_string(),
        first["id"].as_str().unwrap()
    );

    // (c) one pending embedding_queue row for the description.
    let id = Uuid::parse_str(first["id"].as_str().unwrap()).unwrap();
    let queue_row = sqlx::query(
        "SELECT status, field_name FROM embedding_queue \
         WHERE table_name = 'schemas' AND entity_id = $1",
    )
    .bind(id)
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(queue_row.get::<String, _>("status"), "pending");
    assert_eq!(queue_row.get::<String, _>("field_name"), "description");

    // Soft delete removes the kv row.
    repo.soft_delete(id).await.unwrap();
    let gone = sqlx::query("SELECT 1 FROM kv_store WHERE entity_key = $1")
        .bind(&key)
        .fetch_optional(db.pool())
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn untouched_embedded_field_does_not_requeue() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);
    let repo = Repository::for_table(db.clone(), "resources", Arc::clone(&encryption)).unwrap();

    let name = unique("requeue-probe");
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!(name));
    data.insert("content".into(), json!("embeddable body"));
    let stored = repo.upsert(data).await.unwrap();
    let id = Uuid::parse_str(stored["id"].as_str().unwrap()).unwrap();

    // Drain the queue row created by the insert.
    sqlx::query("DELETE FROM embedding_queue WHERE table_name = 'resources' AND entity_id = $1")
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();

    // Touch a non-embedded field only.
    let mut update = serde_json::Map::new();
    update.insert("id".into(), json!(id.to_string()));
    update.insert("comment".into(), json!("metadata-only change"));
    repo.upsert(update).await.unwrap();

    let requeued = sqlx::query(
        "SELECT 1 FROM embedding_queue WHERE table_name = 'resources' AND entity_id = $1",
    )
    .bind(id)
    .fetch_optional(db.pool())
    .await
    .unwrap();
    assert!(requeued.is_none(), "non-embedded update must not re-queue");

    // COALESCE upsert preserved the embedded field.
    let row = repo.get(id).await.unwrap().unwrap();
    assert_eq!(row["content"], json!("embeddable body"));
    assert_eq!(row["comment"], json!("metadata-only change"));
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn encryption_isolation_across_tenants() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);

    let tenant_a = unique("tenant-a");
    let tenant_b = unique("tenant-b");
    encryption.configure_tenant(&tenant_a, true, true, "platform").await.unwrap();
    encryption.configure_tenant(&tenant_b, true, true, "platform").await.unwrap();

    let repo = Repository::for_table(db.clone(), "messages", Arc::clone(&encryption)).unwrap();
    let session_id = Uuid::new_v4();
    let mut data = serde_json::Map::new();
    data.insert("id".into(), json!(Uuid::new_v4().to_string()));
    data.insert("session_id".into(), json!(session_id.to_string()));
    data.insert("message_type".into(), json!("user"));
    data.insert("content".into(), json!("secret-a"));
    data.insert("tenant_id".into(), json!(tenant_a));
    let stored = repo.upsert(data).await.unwrap();
    let id = Uuid::parse_str(stored["id"].as_str().unwrap()).unwrap();

    // At rest: not plaintext.
    let raw = sqlx::query("SELECT content FROM messages WHERE id = $1")
        .bind(id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    let at_rest: String = raw.get("content");
    assert_ne!(at_rest, "secret-a");

    // Read as tenant A (platform mode): plaintext.
    let read = repo.get(id).await.unwrap().unwrap();
    assert_eq!(read["content"], json!("secret-a"));

    // Tenant B's key cannot decrypt A's ciphertext (AAD + key isolation).
    let dek_b = encryption.get_dek(&tenant_b).await.unwrap().unwrap();
    assert!(p8_crypto::try_decrypt_value(&dek_b, &tenant_a, &id.to_string(), &at_rest).is_none());
    assert!(p8_crypto::try_decrypt_value(&dek_b, &tenant_b, &id.to_string(), &at_rest).is_none());
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn deterministic_email_lookup() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);

    let tenant = unique("tenant-email");
    encryption.configure_tenant(&tenant, true, true, "platform").await.unwrap();

    let repo = Repository::for_table(db.clone(), "users", Arc::clone(&encryption)).unwrap();
    let name = unique("alice");
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!(name));
    data.insert("email".into(), json!("a@x.com"));
    data.insert("tenant_id".into(), json!(tenant));
    let stored = repo.upsert(data).await.unwrap();
    let id = stored["id"].as_str().unwrap().to_string();

    // Equality probe built from the same (tenant, entity) pair matches the
    // stored ciphertext exactly.
    let probe = encryption
        .deterministic_probe(&tenant, &id, "a@x.com")
        .await
        .unwrap()
        .unwrap();
    let row = sqlx::query("SELECT id FROM users WHERE email = $1")
        .bind(&probe)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<Uuid, _>("id").to_string(), id);
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn dialect_lookup_fuzzy_and_blocked_sql() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);
    let repo = Repository::for_table(db.clone(), "schemas", Arc::clone(&encryption)).unwrap();

    let name = unique("sarah-chen");
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!(name));
    data.insert("kind".into(), json!("resource"));
    data.insert("description".into(), json!("person of interest"));
    repo.upsert(data).await.unwrap();

    let hits = db.rem_lookup(&normalize_key(&name), None, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity_type, "schemas");
    assert_eq!(hits[0].data["name"], json!(name));

    let fuzzy = db.rem_fuzzy(&name[..name.len() - 4], None, None, 0.1, 10).await.unwrap();
    assert!(!fuzzy.is_empty());

    // Raw SQL mode blocks DDL at validation time.
    let err = p8_store::dialect::validate_sql("DROP TABLE users").unwrap_err();
    assert!(err.to_string().contains("blocked SQL keyword"));
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn traverse_walks_graph_edges_with_back_link() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);
    let repo = Repository::for_table(db.clone(), "schemas", Arc::clone(&encryption)).unwrap();

    let parent = unique("parent-schema");
    let child = unique("child-schema");

    let mut child_row = serde_json::Map::new();
    child_row.insert("name".into(), json!(child));
    child_row.insert("kind".into(), json!("resource"));
    repo.upsert(child_row).await.unwrap();

    let mut parent_row = serde_json::Map::new();
    parent_row.insert("name".into(), json!(parent));
    parent_row.insert("kind".into(), json!("resource"));
    parent_row.insert(
        "graph_edges".into(),
        json!([{ "target": normalize_key(&child), "relation": "imports", "weight": 0.9 }]),
    );
    repo.upsert(parent_row).await.unwrap();

    let walked = db
        .rem_traverse(&normalize_key(&parent), None, None, 1, None)
        .await
        .unwrap();
    // Depth 0 start node plus the direct target.
    assert_eq!(walked.len(), 2);
    assert_eq!(walked[0]["depth"], json!(0));
    assert_eq!(walked[1]["entity_key"], json!(normalize_key(&child)));
    assert_eq!(walked[1]["relation"], json!("imports"));

    // Relation filter excludes non-matching edges.
    let filtered = db
        .rem_traverse(&normalize_key(&parent), None, None, 1, Some("unrelated"))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1, "only the start node should remain");
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn usage_increment_is_monotonic_and_detects_excess() {
    let Some(db) = test_db().await else { return };
    let user_id = Uuid::new_v4();

    let first = p8_store::usage::increment_usage(&db, user_id, "dreaming_io_tokens", 600, "free")
        .await
        .unwrap();
    assert_eq!(first.used, 600);
    assert!(!first.exceeded);

    let second = p8_store::usage::increment_usage(&db, user_id, "dreaming_io_tokens", 9500, "free")
        .await
        .unwrap();
    assert_eq!(second.used, 10_100);
    assert!(second.used >= first.used + 9500);
    assert!(second.exceeded, "free plan dreaming_io_tokens is 10k");
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn build_moment_collapses_messages_above_threshold() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);

    let session_repo = Repository::for_table(db.clone(), "sessions", Arc::clone(&encryption)).unwrap();
    let session_name = unique("chunky-session");
    let mut session = serde_json::Map::new();
    session.insert("name".into(), json!(session_name));
    let stored = session_repo.upsert(session).await.unwrap();
    let session_id = Uuid::parse_str(stored["id"].as_str().unwrap()).unwrap();

    // Two turns of ~100 estimated tokens each.
    for i in 0..2 {
        db.rem_persist_turn(
            session_id,
            &format!("question {i}: {}", "x".repeat(400)),
            &format!("answer {i}: {}", "y".repeat(400)),
            None,
            None,
            None,
            None,
            0, // no auto-moment during setup
        )
        .await
        .unwrap();
    }

    // Below threshold: nothing happens.
    let none = db.rem_build_moment(session_id, None, None, 100_000).await.unwrap();
    assert!(none.is_none());

    // Above threshold: one session_chunk moment appears.
    let built = db.rem_build_moment(session_id, None, None, 10).await.unwrap().unwrap();
    assert!(built.moment_name.contains("chunk-1"));
    assert_eq!(built.message_count, 4);

    let row = sqlx::query("SELECT moment_type, source_session_id FROM moments WHERE id = $1")
        .bind(built.moment_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("moment_type"), "session_chunk");
    assert_eq!(row.get::<Uuid, _>("source_session_id"), session_id);

    // Idempotent on immediate re-run: no new messages accumulated.
    let again = db.rem_build_moment(session_id, None, None, 10).await.unwrap();
    assert!(again.is_none());
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn load_messages_tightest_bound_wins() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);

    let session_repo = Repository::for_table(db.clone(), "sessions", Arc::clone(&encryption)).unwrap();
    let mut session = serde_json::Map::new();
    session.insert("name".into(), json!(unique("bounded-session")));
    let stored = session_repo.upsert(session).await.unwrap();
    let session_id = Uuid::parse_str(stored["id"].as_str().unwrap()).unwrap();

    for i in 0..6 {
        db.rem_persist_turn(session_id, &format!("u{i}"), &format!("a{i}"), None, None, None, None, 0)
            .await
            .unwrap();
    }

    let all = db.rem_load_messages(session_id, None, None, None).await.unwrap();
    assert_eq!(all.len(), 12);

    let capped = db.rem_load_messages(session_id, None, Some(3), None).await.unwrap();
    assert_eq!(capped.len(), 3);
    // Chronological order, and the *most recent* three.
    assert_eq!(capped[0]["message_type"], json!("assistant"));
    assert_eq!(capped[2]["content"], json!("a5"));
}

#[tokio::test]
#[ignore = "needs P8_TEST_DATABASE_URL"]
async fn kv_summary_never_contains_ciphertext_for_encrypted_tables() {
    let Some(db) = test_db().await else { return };
    let encryption = test_encryption(&db);

    let tenant = unique("tenant-kv");
    encryption.configure_tenant(&tenant, true, true, "platform").await.unwrap();

    let repo = Repository::for_table(db.clone(), "moments", Arc::clone(&encryption)).unwrap();
    let name = unique("private-moment");
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!(name));
    data.insert("moment_type".into(), json!("meeting"));
    data.insert("summary".into(), json!("a very private summary"));
    data.insert("tenant_id".into(), json!(tenant));
    let stored = repo.upsert(data).await.unwrap();

    let at_rest = stored["summary"].as_str().unwrap().to_string();
    assert_ne!(at_rest, "a very private summary");

    let kv = sqlx::query("SELECT content_summary FROM kv_store WHERE entity_key = $1 AND tenant_id = $2")
        .bind(normalize_key(&name))
        .bind(&tenant)
        .fetch_one(db.pool())
        .await
        .unwrap();
    let summary: String = kv.get("content_summary");
    assert!(!summary.contains(&at_rest), "ciphertext leaked into kv_store");
    assert!(!summary.contains("very private"), "plaintext leaked into kv_store");

    // The registry agrees with what the trigger did.
    assert!(spec_for("moments").unwrap().is_encrypted());
}
