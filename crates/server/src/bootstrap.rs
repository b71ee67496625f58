//! Shared service bootstrap for the API, workers, and CLI commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use p8_config::Settings;
use p8_crypto::EncryptionService;
use p8_dreaming::DreamingHandler;
use p8_embed::{EmbeddingProvider, EmbeddingService, EmbeddingWorker, create_provider};
use p8_kms::{KmsProvider, LocalFileKms, VaultTransitKms};
use p8_llm::LlmClient;
use p8_queue::handlers::{FileProcessingHandler, NewsHandler, ScheduledHandler};
use p8_queue::{HandlerRegistry, QueueService, Tier, TieredWorker, WorkerContext};
use p8_store::Db;

pub struct Services {
    pub settings: Arc<Settings>,
    pub db: Db,
    pub kms: Arc<dyn KmsProvider>,
    pub encryption: Arc<EncryptionService>,
    pub queue: Arc<QueueService>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub embedding: Arc<EmbeddingService>,
    pub llm: LlmClient,
}

/// Select the configured KMS backend.
pub fn create_kms(settings: &Settings, db: &Db) -> Result<Arc<dyn KmsProvider>> {
    Ok(match settings.kms.provider.as_str() {
        "vault" => Arc::new(VaultTransitKms::new(
            &settings.kms.vault_url,
            &settings.kms.vault_token,
            &settings.kms.vault_transit_key,
            db.pool().clone(),
        )),
        _ => Arc::new(
            LocalFileKms::new(&settings.kms.local_keyfile, db.pool().clone())
                .context("opening local master keyfile")?,
        ),
    })
}

/// Connect the pool and wire every shared service, in dependency order.
pub async fn bootstrap(settings: Settings) -> Result<Services> {
    settings.export_sdk_env();
    let settings = Arc::new(settings);

    let db = Db::connect(
        &settings.database.url,
        settings.database.pool_min,
        settings.database.pool_max,
    )
    .await?;

    let kms = create_kms(&settings, &db)?;
    let encryption = Arc::new(EncryptionService::new(
        Arc::clone(&kms),
        &settings.encryption.system_tenant_id,
        Duration::from_secs(settings.encryption.dek_cache_ttl_secs),
    ));
    ensure_system_key(&encryption, &db, &settings).await?;

    let provider = create_provider(&settings);
    let embedding = Arc::new(EmbeddingService::new(
        db.clone(),
        Arc::clone(&provider),
        Arc::clone(&encryption),
        settings.embedding.batch_size,
    ));

    let queue = Arc::new(QueueService::new(db.clone()));
    let llm = LlmClient::new(&settings.llm.base_url, &settings.llm.openai_api_key);

    info!(
        kms = %settings.kms.provider,
        embedding = %settings.embedding.model,
        tier = %settings.worker.tier,
        "services bootstrapped"
    );

    Ok(Services { settings, db, kms, encryption, queue, provider, embedding, llm })
}

/// Ensure the system DEK exists, retrying once after clearing a stale row —
/// a rotated master key leaves an unwrappable system entry behind.
async fn ensure_system_key(
    encryption: &Arc<EncryptionService>,
    db: &Db,
    settings: &Settings,
) -> Result<()> {
    if let Err(first) = encryption.ensure_system_key().await {
        warn!(error = %first, "system key unwrap failed; clearing and regenerating");
        sqlx::query("DELETE FROM tenant_keys WHERE tenant_id = $1")
            .bind(&settings.encryption.system_tenant_id)
            .execute(db.pool())
            .await?;
        encryption.invalidate_tenant(&settings.encryption.system_tenant_id);
        encryption.ensure_system_key().await?;
    }
    Ok(())
}

/// All built-in task handlers, dreaming included.
pub fn default_handler_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("file_processing", Arc::new(FileProcessingHandler));
    registry.register("scheduled", Arc::new(ScheduledHandler));
    registry.register("news", Arc::new(NewsHandler));
    registry.register("dreaming", Arc::new(DreamingHandler));
    Arc::new(registry)
}

/// Spawn the background loops for this process: the embedding poller (when
/// enabled) and a tiered task worker for the configured tier. Returns join
/// handles so `serve` can drain them on shutdown.
pub fn spawn_background(
    services: &Services,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    if services.settings.embedding.worker_enabled {
        let worker = EmbeddingWorker::new(
            Arc::clone(&services.embedding),
            Duration::from_secs_f64(services.settings.embedding.poll_interval_secs),
        );
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    let tier = Tier::parse(&services.settings.worker.tier).unwrap_or(Tier::Small);
    let worker = TieredWorker::new(
        tier,
        Duration::from_secs_f64(services.settings.worker.poll_interval_secs),
        services.settings.worker.batch_size as i32,
        default_handler_registry(),
    );
    let ctx = WorkerContext {
        db: services.db.clone(),
        encryption: Arc::clone(&services.encryption),
        queue: Arc::clone(&services.queue),
        embedding: Arc::clone(&services.embedding),
        llm: services.llm.clone(),
        settings: Arc::clone(&services.settings),
        worker_id: worker.worker_id().to_string(),
        tier,
    };
    let rx = shutdown;
    handles.push(tokio::spawn(async move { worker.run(ctx, rx).await }));

    handles
}
