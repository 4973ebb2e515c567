//! Duel Relay Server - two-player room relay with matchmaking and a scoreboard
//!
//! This is the main entry point for the server. It handles:
//! - WebSocket connections for matchmaking and in-room relay
//! - HTTP endpoints for player registration and the scoreboard
//! - Durable score persistence through the configured ledger backend

mod app;
mod config;
mod game;
mod http;
mod matchmaking;
mod store;
mod util;
mod ws;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::{open_backend, AppState};
use crate::config::Config;
use crate::http::build_router;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Duel Relay Server");
    info!("Server address: {}", config.server_addr);

    // Open persistence before accepting anyone
    let backend = open_backend(&config)?;

    // Create application state
    let (state, requeue_rx) = AppState::new(config.clone(), backend);

    // Spawn matchmaking service
    let matchmaker = tokio::spawn(state.matchmaker.clone().run(requeue_rx));

    // Build router
    let router = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws?player=<name>", addr);

    // Rooms are drained before the listener stops so players get their LEAVE
    let registry = state.registry.clone();
    let drain = config.shutdown_drain;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            registry.shutdown(drain).await;
        })
        .await?;

    matchmaker.abort();

    let unresolved = state.ledger.unresolved();
    for entry in &unresolved {
        warn!(match_id = %entry.match_id, reason = %entry.reason, "Unresolved match at shutdown");
    }
    state.ledger.close().await?;

    info!("Server shutdown complete");
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
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
