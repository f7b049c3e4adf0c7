//! Lagoon - A lightweight federated activity-exchange server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Outbox dispatch, timelines                               │
//! │  - Federation pull + job visibility                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Core Services                            │
//! │  - Activity registry / dispatcher / handlers                │
//! │  - Visibility resolver, timeline fan-out                    │
//! │  - Delivery queue + pull protocol                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `activity`: registry, normalization, dispatch, handlers
//! - `visibility`: audience resolution and sanitization
//! - `timeline`: per-viewer fan-out engine
//! - `federation`: delivery queue and pull/cursor protocol
//! - `data`: database and models
//! - `config`: configuration management
//! - `error`: error types

pub mod activity;
pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod timeline;
pub mod visibility;

use std::sync::Arc;
use std::time::Duration;

use activity::{ActivityRegistry, Dispatcher, Handlers, HookSet};
use federation::{DeliveryQueue, DeliverySettings, IssuerKeyCache, PullProtocol};
use timeline::FanOutEngine;

const INSTANCE_PRIVATE_KEY_SETTING: &str = "instance_private_key_pem";
const INSTANCE_PUBLIC_KEY_SETTING: &str = "instance_public_key_pem";

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and core services.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Activity dispatcher
    pub dispatcher: Arc<Dispatcher>,

    /// Outbound delivery queue
    pub delivery: Arc<DeliveryQueue>,

    /// Timeline fan-out engine
    pub fanout: Arc<FanOutEngine>,

    /// Pull/cursor protocol
    pub pull: Arc<PullProtocol>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Server-actor id advertised to peers
    pub subject: String,

    /// Instance public key, served from the well-known endpoint
    pub public_key_pem: String,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Ensure the instance signing identity exists
    /// 3. Initialize the HTTP client
    /// 4. Wire up core services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Ensure instance identity
        let (private_key_pem, public_key_pem) = Self::ensure_instance_identity(&db).await?;

        // 3. Initialize HTTP client
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent("Lagoon/0.1.0")
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 4. Wire up core services
        let local_domain = config.server.domain.clone();
        let subject = format!("{}/actor", config.server.base_url());

        let delivery = Arc::new(DeliveryQueue::new(
            db.clone(),
            http_client.clone(),
            DeliverySettings {
                max_attempts: config.federation.max_attempts,
                backoff_base: Duration::from_secs(config.federation.backoff_base_seconds),
                backoff_cap: Duration::from_secs(config.federation.backoff_cap_seconds),
                request_timeout: Duration::from_secs(config.federation.delivery_timeout_seconds),
                job_ttl_seconds: config.federation.job_ttl_seconds,
                local_domain: local_domain.clone(),
                protocol: config.server.protocol.clone(),
            },
        ));

        let key_cache = Arc::new(IssuerKeyCache::new(
            http_client.clone(),
            Some(Duration::from_secs(config.federation.key_cache_ttl_seconds)),
        ));
        // Peers resolve our key over the network; our own tokens verify
        // locally without a fetch.
        key_cache
            .seed(&config.server.base_url(), public_key_pem.clone())
            .await;

        let pull = Arc::new(PullProtocol::new(
            db.clone(),
            key_cache,
            http_client.clone(),
            config.server.base_url(),
            subject.clone(),
            private_key_pem,
            config.federation.token_ttl_seconds,
            config.federation.nonce_ttl_seconds,
            config.federation.pull_audience_cap,
        ));

        let fanout = Arc::new(FanOutEngine::new(
            db.clone(),
            local_domain.clone(),
            Duration::from_secs(config.federation.backoff_base_seconds),
            Duration::from_secs(config.federation.backoff_cap_seconds),
        ));

        let registry = Arc::new(ActivityRegistry::new());
        let handlers = Handlers::new(
            db.clone(),
            local_domain.clone(),
            config.timeline.fanout_max_attempts,
        );
        let hooks = Arc::new(HookSet::new());

        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            registry,
            handlers,
            hooks,
            delivery.clone(),
            local_domain,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            dispatcher,
            delivery,
            fanout,
            pull,
            http_client,
            subject,
            public_key_pem,
        })
    }

    /// Ensure the instance signing keypair exists.
    ///
    /// Generates an RSA keypair on first start and persists it; later
    /// starts reuse the stored keys so peers' cached copies stay valid.
    async fn ensure_instance_identity(
        db: &data::Database,
    ) -> Result<(String, String), error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        if let (Some(private_pem), Some(public_pem)) = (
            db.get_setting(INSTANCE_PRIVATE_KEY_SETTING).await?,
            db.get_setting(INSTANCE_PUBLIC_KEY_SETTING).await?,
        ) {
            tracing::info!("Instance identity loaded");
            return Ok((private_pem, public_pem));
        }

        tracing::info!("Generating instance keypair...");

        let mut rng = rand::thread_rng();
        let bits = 2048;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?
            .to_string();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?;

        db.set_setting(INSTANCE_PRIVATE_KEY_SETTING, &private_pem)
            .await?;
        db.set_setting(INSTANCE_PUBLIC_KEY_SETTING, &public_pem)
            .await?;

        tracing::info!("Instance keypair generated");
        Ok((private_pem, public_pem))
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .merge(api::api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
