//! Lagoon binary entry point

use lagoon::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background workers (delivery, fan-out, sweeps)
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("LAGOON__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "lagoon=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "lagoon=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Lagoon...");

    // 2. Initialize metrics
    lagoon::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = lagoon::build_router(state.clone());

    // 6. Start background workers
    spawn_delivery_worker(state.clone());
    spawn_fanout_worker(state.clone());
    spawn_sweep_task(state.clone());

    // 7. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Spawn the delivery worker polling loop.
///
/// One sweep per tick; per-job failures are handled inside the queue so
/// the loop itself only logs sweep-level errors.
fn spawn_delivery_worker(state: AppState) {
    tokio::spawn(async move {
        let interval_secs = state.config.federation.poll_interval_seconds.max(1);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        loop {
            interval.tick().await;

            if let Err(error) = state.delivery.poll_and_process().await {
                tracing::error!(%error, "Delivery worker sweep failed");
            }
        }
    });

    tracing::info!("Delivery worker spawned");
}

/// Spawn the timeline fan-out worker polling loop.
fn spawn_fanout_worker(state: AppState) {
    tokio::spawn(async move {
        let interval_secs = state.config.timeline.fanout_poll_interval_seconds.max(1);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        loop {
            interval.tick().await;

            if let Err(error) = state.fanout.poll_and_process().await {
                tracing::error!(%error, "Fan-out worker sweep failed");
            }
        }
    });

    tracing::info!("Fan-out worker spawned");
}

/// Spawn the hourly cleanup sweep: expired delivery jobs, expired
/// nonces, and timeline retention.
fn spawn_sweep_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));

        // Consume the immediate first tick so the first sweep runs after
        // one full interval.
        interval.tick().await;

        loop {
            interval.tick().await;

            tracing::info!("Running cleanup sweep...");

            if let Err(error) = state.delivery.sweep_expired().await {
                tracing::error!(%error, "Delivery TTL sweep failed");
            }
            if let Err(error) = state.pull.sweep_expired_nonces().await {
                tracing::error!(%error, "Nonce sweep failed");
            }
            if let Err(error) = state
                .fanout
                .sweep_retention(state.config.timeline.retention_seconds)
                .await
            {
                tracing::error!(%error, "Timeline retention sweep failed");
            }
        }
    });

    tracing::info!("Cleanup sweep task spawned");
}
