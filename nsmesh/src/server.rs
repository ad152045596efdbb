//! Registry server wiring and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use nsmesh_core::Config;
use nsmesh_registry::registry::{
    probe_for, ConnectionTable, HealEvent, Healer, PeerSignals, Prober, RedisPersistence,
    RegistryService, RegistryStore,
};
use nsmesh_registry::{NetworkServiceRegistryServer, RegistryServer};

/// Capacity of the prober -> healer event channel
const LIVENESS_CHANNEL_CAPACITY: usize = 1024;

/// Name stamped on registrations: hostname plus a random suffix
fn generate_manager_name() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

pub async fn run(config: Config) -> Result<()> {
    let manager_name = if config.server.manager_name.is_empty() {
        generate_manager_name()
    } else {
        config.server.manager_name.clone()
    };
    info!(manager = %manager_name, "nsmesh registry starting...");

    let store = Arc::new(RegistryStore::new());
    let table = Arc::new(ConnectionTable::new(config.healing.tombstone_ttl()));
    let signals = Arc::new(PeerSignals::new());

    let mut service = RegistryService::new(
        store,
        table.clone(),
        signals.clone(),
        config.registry.selection,
        manager_name,
    );
    if config.registry.redis_url.is_empty() {
        info!("Redis not configured, registry is in-memory only");
    } else {
        match RedisPersistence::new(&config.registry.redis_url) {
            Ok(persistence) => service = service.with_persistence(Arc::new(persistence)),
            Err(e) => error!("Failed to configure endpoint persistence: {e}"),
        }
    }
    let service = Arc::new(service);

    if let Err(e) = service.restore().await {
        warn!("Failed to restore persisted endpoints (non-fatal): {e}");
    }

    let (events_tx, events_rx) = mpsc::channel(LIVENESS_CHANNEL_CAPACITY);
    let prober = Arc::new(Prober::new(
        table,
        probe_for(&config.probe, signals),
        events_tx,
        config.probe.clone(),
    ));
    let healer = Arc::new(Healer::new(service.clone(), config.healing.clone()));

    let heal_log = tokio::spawn(log_heal_events(healer.subscribe()));
    let prober_task = prober.clone().start();
    let healer_task = healer.clone().start(events_rx);
    info!(
        healing_enabled = config.healing.enabled,
        suspect_wait = ?config.healing.suspect_wait(),
        max_attempts = config.healing.max_attempts,
        probe_interval = ?config.probe.interval(),
        probe_mode = ?config.probe.mode,
        "Liveness prober and healer started"
    );

    let addr: SocketAddr = config
        .grpc_address()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid gRPC address {}: {e}", config.grpc_address()))?;
    info!("gRPC server listening on {addr}");

    let served = tonic::transport::Server::builder()
        .add_service(NetworkServiceRegistryServer::new(RegistryServer::new(service)))
        .serve_with_shutdown(addr, shutdown_signal())
        .await;

    info!("Stopping background loops...");
    prober.shutdown();
    healer.shutdown();
    if let Err(e) = prober_task.await {
        error!("Prober task failed: {e}");
    }
    if let Err(e) = healer_task.await {
        error!("Healer task failed: {e}");
    }
    heal_log.abort();

    served.map_err(|e| anyhow::anyhow!("gRPC server error: {e}"))?;
    info!("nsmesh registry stopped");
    Ok(())
}

async fn log_heal_events(mut events: broadcast::Receiver<HealEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => tracing::debug!(?event, "Heal event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Heal event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
