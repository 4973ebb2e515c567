//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::app::{AppState, OnlineGuard};
use crate::http::AppError;
use crate::util::rate_limit::InboundRateLimiter;

use super::connection::{Connection, Transport};
use super::pump::{run_reader, run_writer};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Player name; created in the ledger on first connect
    pub player: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let player = query.player.trim().to_string();
    if player.is_empty() {
        return AppError::BadRequest("player name is required".to_string()).into_response();
    }

    if let Err(e) = state.ledger.ensure_player(&player).await {
        warn!(player = %player, error = %e, "Could not load player for WebSocket");
        return AppError::from(e).into_response();
    }

    let Some(guard) = state.online.claim(&player) else {
        warn!(player = %player, "Refusing second connection for online player");
        return AppError::Conflict(format!("{} is already connected", player)).into_response();
    };

    info!(player = %player, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, player, guard, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, player: String, _online: OnlineGuard, state: AppState) {
    let settings = state.config.connection_settings();
    let (connection, transport) = Connection::open(player.clone(), &settings);
    let connection_id = connection.id();
    info!(connection_id = %connection_id, player = %player, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();
    let Transport { inbound, outbound } = transport;

    let writer = tokio::spawn(run_writer(
        ws_sink,
        outbound,
        inbound.closed_signal(),
        settings.close_flush,
    ));

    state.matchmaker.enqueue(connection);

    // Runs until the client goes away or the server closes the connection
    let limiter = InboundRateLimiter::new(settings.inbound_rate_limit);
    run_reader(ws_stream, &inbound, limiter).await;

    // Cleanup on disconnect
    state.matchmaker.cancel(connection_id);
    state.registry.connection_lost(connection_id);
    let _ = writer.await;

    info!(connection_id = %connection_id, player = %player, "WebSocket connection closed");
}
