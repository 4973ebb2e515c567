//! Persistence backend contract for the score ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Player row as stored in the `players` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    /// Registration ordinal, increasing in registration order
    pub id: i64,
    pub player_name: String,
    pub score: i64,
    pub matches_played: i64,
    /// Best single-match score
    pub highest_score: i64,
    pub created_at: DateTime<Utc>,
}

/// One player's result for one match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub player_id: String,
    pub delta: i64,
    pub match_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

impl ScoreRecord {
    pub fn new(player_id: impl Into<String>, delta: i64, match_id: Uuid) -> Self {
        Self {
            player_id: player_id.into(),
            delta,
            match_id,
            recorded_at: Utc::now(),
        }
    }
}

/// Result of applying a score record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    /// The delta was added to the player's score
    Applied,
    /// This (match, player) pair was already applied; nothing changed
    Duplicate,
}

/// Storage backend errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("player name already taken: {0}")]
    Conflict(String),

    #[error("unknown player: {0}")]
    UnknownPlayer(String),

    #[error("score for {0} would overflow")]
    ScoreOverflow(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("storage unavailable")]
    Unavailable,
}

impl BackendError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::Task(_) | Self::Unavailable => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Durable store behind the score ledger.
///
/// `apply` must be idempotent per (match id, player): a second call with the
/// same pair returns `Duplicate` without touching the score, also across
/// restarts for durable backends.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Create a player; `Conflict` if the name is taken
    async fn register(&self, name: &str) -> Result<Player, BackendError>;

    /// Create the player if missing and return it
    async fn ensure_player(&self, name: &str) -> Result<Player, BackendError>;

    async fn player(&self, name: &str) -> Result<Option<Player>, BackendError>;

    async fn apply(&self, record: &ScoreRecord) -> Result<CommitOutcome, BackendError>;

    /// Players by score descending, ties by registration order
    async fn top(&self, limit: usize) -> Result<Vec<Player>, BackendError>;

    /// Release resources; called once on shutdown
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
