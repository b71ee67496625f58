//! The tiered worker: poll, claim, dispatch, account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{error, info, warn};

use p8_config::Settings;
use p8_crypto::EncryptionService;
use p8_embed::EmbeddingService;
use p8_llm::LlmClient;
use p8_store::Db;
use p8_store::ids::short_id;

use crate::service::QueueService;
use crate::{Task, Tier};

/// Shared services passed to task handlers.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Db,
    pub encryption: Arc<EncryptionService>,
    pub queue: Arc<QueueService>,
    pub embedding: Arc<EmbeddingService>,
    pub llm: LlmClient,
    pub settings: Arc<Settings>,
    pub worker_id: String,
    pub tier: Tier,
}

/// One task handler, registered by task_type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process a task; the returned map is stored as the task result.
    async fn handle(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<Value>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        info!(task_type, "task handler registered");
        self.handlers.insert(task_type.to_string(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }
}

/// Background worker bound to one tier. The same binary serves every tier;
/// configuration selects which one this process polls.
pub struct TieredWorker {
    tier: Tier,
    poll_interval: Duration,
    batch_size: i32,
    worker_id: String,
    registry: Arc<HandlerRegistry>,
}

impl TieredWorker {
    pub fn new(
        tier: Tier,
        poll_interval: Duration,
        batch_size: i32,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            tier,
            poll_interval,
            batch_size,
            worker_id: short_id("worker-"),
            registry,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll until `shutdown` flips. A batch already claimed is drained to
    /// completion before the loop exits; no new batches are claimed after
    /// the signal.
    pub async fn run(&self, ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            tier = %self.tier,
            poll_secs = self.poll_interval.as_secs_f64(),
            batch = self.batch_size,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let tasks = match ctx.queue.claim(self.tier, &self.worker_id, self.batch_size).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(error = %e, "claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval * 2) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            if tasks.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for task in tasks {
                self.process_task(task, &ctx).await;
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn process_task(&self, task: Task, ctx: &WorkerContext) {
        let task_id = task.id;
        let task_type = task.task_type.clone();

        let Some(handler) = self.registry.get(&task_type) else {
            let _ = ctx
                .queue
                .fail(task_id, &format!("No handler registered for task_type={task_type}"))
                .await;
            return;
        };

        // Pre-flight quota check: record-and-stop, no retry.
        match ctx.queue.check_task_quota(&task).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = ctx.queue.fail(task_id, "Quota exceeded").await;
                return;
            }
            Err(e) => {
                warn!(%task_id, error = %e, "quota check errored; failing task");
                let _ = ctx.queue.fail(task_id, &e.to_string()).await;
                return;
            }
        }

        match handler.handle(&task, ctx).await {
            Ok(result) => {
                if let Err(e) = ctx.queue.complete(task_id, Some(result)).await {
                    error!(%task_id, error = %e, "failed to record completion");
                }
            }
            Err(e) => {
                error!(%task_id, task_type = %task_type, error = %e, "task handler failed");
                let _ = ctx
                    .queue
                    .emit_event(
                        task_id,
                        "error",
                        Some(&self.worker_id),
                        Some(&e.to_string()),
                        Some(json!({ "task_type": task_type })),
                    )
                    .await;
                let _ = ctx.queue.fail(task_id, &e.to_string()).await;
            }
        }
    }
}
