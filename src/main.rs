//! GutterTheory client core - presence fusion and aim assist for
//! location-based multiplayer play
//!
//! This is the main entry point for the client process. It handles:
//! - the LAN mesh transport and the optional backend connection
//! - backend discovery over mDNS with a cached fallback
//! - the local control/status HTTP surface a UI binds to

mod app;
mod config;
mod discovery;
mod geo;
mod http;
mod orchestrator;
mod presence;
mod protocol;
mod targeting;
mod transport;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::app::AppState;
use crate::config::Config;
use crate::discovery::DiscoveryConfig;
use crate::http::build_router;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, StaticSensor};
use crate::transport::{UdpMeshLink, UdpMeshLinkConfig};
use crate::util::time::init_process_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize uptime tracking
    init_process_time();

    // Fresh identity per process; never persisted
    let player_id = Uuid::new_v4();
    info!(player_id = %player_id, name = %config.player_name, "Starting GutterTheory client");
    info!(mode = ?config.mode, mesh_port = config.mesh_port, "Connectivity");

    let link = Arc::new(UdpMeshLink::new(UdpMeshLinkConfig {
        port: config.mesh_port,
        broadcast: config.mesh_broadcast,
    }));
    let sensor = Arc::new(StaticSensor::new(config.static_location, config.static_heading));

    let orchestrator_config = OrchestratorConfig {
        player_id,
        player_name: config.player_name.clone(),
        mode: config.mode,
        mesh_secret: config.mesh_secret.clone(),
        discovery: DiscoveryConfig {
            cache_path: config.discovery_cache_path.clone(),
            seed: config.backend_url.clone(),
            mdns_enabled: config.mdns_enabled,
        },
        seed: rand::random(),
    };
    let (orchestrator, handle) = Orchestrator::new(orchestrator_config, link, sensor);
    let actor = tokio::spawn(orchestrator.run());

    if config.auto_start {
        handle.start().await?;
    }
    if let Some(code) = config.lobby_code.clone() {
        if let Err(e) = handle.join_lobby(code.clone()).await {
            warn!(lobby = %code, error = %e, "Failed to join configured lobby");
        }
    }

    // Build router
    let state = AppState::new(config.clone(), handle.clone());
    let router = build_router(state);

    // Start control surface
    let addr: SocketAddr = config.api_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Control API listening on {}", addr);
    info!("Snapshot: http://{}/v1/snapshot", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop transports, then let the actor exit once every handle is gone
    handle.stop().await?;
    drop(handle);
    if let Err(e) = actor.await {
        warn!(error = %e, "Orchestrator task ended abnormally");
    }

    info!("Client shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
