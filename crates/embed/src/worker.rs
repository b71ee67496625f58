//! Polling worker: drains the embedding queue until told to stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::service::EmbeddingService;

pub struct EmbeddingWorker {
    service: Arc<EmbeddingService>,
    poll_interval: Duration,
}

impl EmbeddingWorker {
    pub fn new(service: Arc<EmbeddingService>, poll_interval: Duration) -> Self {
        Self { service, poll_interval }
    }

    /// Run until `shutdown` flips to true. An empty batch sleeps one poll
    /// interval; a non-empty batch loops immediately so a backlog drains at
    /// full speed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_secs = self.poll_interval.as_secs_f64(), "embedding worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.service.process_batch().await {
                Ok(summary) if summary.processed == 0 && summary.failed == 0 => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {
                    // More work may be waiting; poll again immediately.
                }
                Err(e) => {
                    error!(error = %e, "embedding worker batch error");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("embedding worker stopped");
    }
}
