// =============================================================================
// Auction Sentinel — Main Entry Point
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod circuit_breaker;
mod config;
mod coordinator;
mod crypto;
mod errors;
mod events;
mod hub;
mod pipelines;
mod state_machine;
mod store;
mod strategy;
mod types;
mod upstream;

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::AppConfig;
use crate::coordinator::MonitorCoordinator;
use crate::pipelines::polling_queue::PollingQueue;
use crate::pipelines::UpdateRouter;
use crate::store::{LayeredStore, Store};
use crate::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config = AppConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Auction Sentinel — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(port = config.port, use_stream = config.use_stream, use_polling_queue = config.use_polling_queue, "loaded configuration");

    // ── 2. Store ──────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(LayeredStore::connect(config.store_url.as_deref()).await);

    // ── 3. Upstream clients + circuit breaker ────────────────────────────
    // EventStream talks to upstream directly (a long-lived SSE subscription
    // doesn't fit the request/response breaker model); PollingQueue and
    // client-initiated bids go through the breaker. Each needs its own
    // `UpstreamClient` because `CircuitBreaker::new` takes one by value.
    let upstream = Arc::new(UpstreamClient::new(
        config.base_url.clone(),
        config.api_url.clone(),
        config.signing_secret.clone(),
        config.api_rate_limit_max,
    )?);

    // A disabled breaker is modeled as one with an effectively unreachable
    // failure threshold rather than a second code path.
    let failure_threshold = if config.use_circuit_breaker {
        config.circuit_breaker_failure_threshold
    } else {
        u32::MAX
    };
    let breaker = Arc::new(CircuitBreaker::new(
        UpstreamClient::new(
            &config.base_url,
            &config.api_url,
            &config.signing_secret,
            config.api_rate_limit_max,
        )?,
        failure_threshold,
        config.circuit_breaker_timeout,
    ));

    // ── 4. Pipelines ──────────────────────────────────────────────────────
    let (snapshot_tx, snapshots_rx) =
        tokio::sync::mpsc::channel(crate::events::SNAPSHOT_CHANNEL_CAPACITY);

    let polling = PollingQueue::new(breaker.clone(), snapshot_tx.clone(), config.circuit_breaker_timeout);
    let router = Arc::new(UpdateRouter::new(
        polling.clone(),
        upstream.clone(),
        snapshot_tx,
        config.sse_url.clone(),
        config.use_stream,
    ));

    let (coordinator, notifications_rx) = MonitorCoordinator::new(
        store.clone(),
        upstream.clone(),
        breaker.clone(),
        router,
        polling.clone(),
        config.encryption_secret.clone(),
    );

    coordinator.recover_from_store().await?;

    // ── 5. Background loops ───────────────────────────────────────────────
    tokio::spawn(coordinator.clone().run_snapshot_loop(snapshots_rx));
    tokio::spawn(coordinator.clone().run_notification_fanout(notifications_rx));
    tokio::spawn(coordinator.clone().run_breaker_watch());
    tokio::spawn(coordinator.clone().run_audit_log());
    if config.use_polling_queue {
        tokio::spawn(polling.run());
    }

    // ── 6. ClientHub WebSocket server ────────────────────────────────────
    let hub_state = hub::HubState::new(coordinator.clone(), config.auth_token.clone());
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let bind_addr_for_log = bind_addr.clone();

    tokio::spawn(async move {
        let app = hub::router(hub_state).into_make_service_with_connect_info::<std::net::SocketAddr>();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind hub server");
        info!(addr = %bind_addr_for_log, "client hub listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "hub server failed");
        }
    });

    info!("all subsystems running. press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    coordinator.shutdown().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    info!("auction sentinel shut down complete.");
    Ok(())
}
