//! HTTP surface and process bootstrap.
//!
//! `serve` hosts three things in one process: the axum API, the embedding
//! poller, and a tiered task worker for this process's configured tier. The
//! same binary serves every tier — environment selects the role.

pub mod bootstrap;
pub mod error;
pub mod routes;

pub use bootstrap::{Services, bootstrap};
pub use error::ApiError;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use tower_http::trace::TraceLayer;

use p8_config::Settings;
use p8_crypto::EncryptionService;
use p8_embed::{EmbeddingProvider, EmbeddingService};
use p8_llm::LlmClient;
use p8_queue::QueueService;
use p8_store::Db;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: Db,
    pub encryption: Arc<EncryptionService>,
    pub queue: Arc<QueueService>,
    pub embedding: Arc<EmbeddingService>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub llm: LlmClient,
}

impl AppState {
    pub fn from_services(services: &Services) -> Self {
        Self {
            settings: Arc::clone(&services.settings),
            db: services.db.clone(),
            encryption: Arc::clone(&services.encryption),
            queue: Arc::clone(&services.queue),
            embedding: Arc::clone(&services.embedding),
            provider: Arc::clone(&services.provider),
            llm: services.llm.clone(),
        }
    }
}

/// Build the full router: routes, auth, request tracing.
pub fn build_app(state: AppState) -> Router {
    let authed = routes::router(state.clone());

    let app = if state.settings.api.api_key.is_empty() {
        authed
    } else {
        authed.layer(middleware::from_fn_with_state(state.clone(), require_bearer))
    };

    app.layer(TraceLayer::new_for_http())
}

/// Simple service-to-service bearer auth, enabled by `P8_API_KEY`.
/// The health probe stays open for orchestrators.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.uri().path() == "/healthz" {
        return Ok(next.run(request).await);
    }

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.settings.api.api_key);

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
