//! Embedding pipeline: pluggable providers and the queue drainer.
//!
//! The queue is populated by database triggers whenever an embeddable field
//! changes. Workers claim batches with `FOR UPDATE SKIP LOCKED`, dedupe by
//! content hash, embed in one provider call, and upsert vectors into the
//! per-table embedding stores.

mod providers;
mod service;
mod worker;

pub use providers::{LocalHashProvider, OpenAiRestProvider, create_provider, parse_embedding_model};
#[cfg(feature = "fastembed")]
pub use providers::FastEmbedProvider;
pub use service::{BatchSummary, EmbeddingService, QueryEmbedderHandle};
pub use worker::EmbeddingWorker;

use async_trait::async_trait;

/// Generates embedding vectors from text. Implementations must be safe for
/// concurrent calls; the provider is shared across workers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Batch-embed. Returns one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    fn provider_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}
