//! HTTP route definitions

use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::warn;
use uuid::Uuid;

use crate::app::AppState;
use crate::store::{CommitOutcome, LedgerError, Player, UnresolvedMatch};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

const DEFAULT_SCOREBOARD_LIMIT: usize = 10;
const MAX_SCOREBOARD_LIMIT: usize = 100;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let api_routes = Router::new()
        .route("/players", post(register_player_handler))
        .route("/players/:name", get(player_handler))
        .route("/scoreboard", get(scoreboard_handler))
        .route("/matches/unresolved", get(unresolved_handler))
        .route("/matches/unresolved/:match_id/retry", post(retry_match_handler))
        .layer(TimeoutLayer::new(state.config.request_timeout));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .merge(api_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    ledger_backend: &'static str,
    active_rooms: usize,
    queue_size: usize,
    online_players: usize,
    unresolved_matches: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        ledger_backend: state.ledger.backend_name(),
        active_rooms: state.registry.active_rooms(),
        queue_size: state.matchmaker.queue_size(),
        online_players: state.online.count(),
        unresolved_matches: state.ledger.unresolved().len(),
    })
}

// ============================================================================
// Player endpoints
// ============================================================================

#[derive(Deserialize)]
struct RegisterRequest {
    player_name: String,
}

async fn register_player_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Player>), AppError> {
    let name = req.player_name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("player_name must not be empty".to_string()));
    }

    let player = state.ledger.register(name).await?;
    Ok((StatusCode::CREATED, Json(player)))
}

async fn player_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Player>, AppError> {
    state
        .ledger
        .read(&name)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("player {}", name)))
}

#[derive(Deserialize)]
struct ScoreboardQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ScoreboardResponse {
    players: Vec<Player>,
}

async fn scoreboard_handler(
    State(state): State<AppState>,
    Query(query): Query<ScoreboardQuery>,
) -> Result<Json<ScoreboardResponse>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SCOREBOARD_LIMIT)
        .clamp(1, MAX_SCOREBOARD_LIMIT);
    let players = state.ledger.top_n(limit).await?;
    Ok(Json(ScoreboardResponse { players }))
}

// ============================================================================
// Reconciliation endpoints
// ============================================================================

#[derive(Serialize)]
struct UnresolvedResponse {
    matches: Vec<UnresolvedMatch>,
}

async fn unresolved_handler(State(state): State<AppState>) -> Json<UnresolvedResponse> {
    Json(UnresolvedResponse {
        matches: state.ledger.unresolved(),
    })
}

#[derive(Serialize)]
struct RetryResponse {
    match_id: Uuid,
    outcomes: Vec<CommitOutcome>,
}

async fn retry_match_handler(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<RetryResponse>, AppError> {
    let outcomes = state
        .ledger
        .reconcile(match_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("unresolved match {}", match_id)))?;
    Ok(Json(RetryResponse { match_id, outcomes }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Conflict(name) => Self::Conflict(format!("player name already taken: {}", name)),
            LedgerError::UnknownPlayer(name) => Self::NotFound(format!("player {}", name)),
            LedgerError::Timeout(_) | LedgerError::PersistenceFailure { .. } => {
                Self::Unavailable(err.to_string())
            }
            LedgerError::Backend(e) => {
                warn!(error = %e, "Ledger backend error");
                Self::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
