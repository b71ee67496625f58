//! Durable, tiered, at-least-once task execution.
//!
//! Tasks live in `task_queue`; workers claim batches for their tier with
//! `FOR UPDATE SKIP LOCKED`, dispatch to registered handlers, and write
//! results or retry-with-backoff failures back through the SQL functions.

pub mod handlers;
mod service;
mod worker;

pub use service::QueueService;
pub use worker::{HandlerRegistry, TaskHandler, TieredWorker, WorkerContext};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Worker pool class. `micro` is always-on; the rest scale with pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Micro,
    Small,
    Medium,
    Large,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Micro => "micro",
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "micro" => Some(Tier::Micro),
            "small" => Some(Tier::Small),
            "medium" => Some(Tier::Medium),
            "large" => Some(Tier::Large),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One claimed task row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub tier: String,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub payload: Value,
    pub priority: i32,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl Task {
    /// Payload field access that tolerates stringified JSON.
    pub fn payload_object(&self) -> Value {
        match &self.payload {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
            other => other.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] p8_store::StoreError),
    #[error("unknown tier: {0}")]
    UnknownTier(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips() {
        for tier in [Tier::Micro, Tier::Small, Tier::Medium, Tier::Large] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::parse("gigantic"), None);
    }

    #[test]
    fn payload_object_tolerates_stringified_json() {
        let task = Task {
            id: Uuid::new_v4(),
            task_type: "scheduled".to_string(),
            tier: "small".to_string(),
            user_id: None,
            tenant_id: None,
            payload: Value::String(r#"{"action":"kv_rebuild"}"#.to_string()),
            priority: 0,
            status: "processing".to_string(),
            scheduled_at: Utc::now(),
            retry_count: 0,
            max_retries: 3,
        };
        assert_eq!(task.payload_object()["action"], "kv_rebuild");
    }
}
