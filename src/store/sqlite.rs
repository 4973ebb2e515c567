//! SQLite ledger backend using rusqlite
//!
//! The connection is synchronous; every call runs on the blocking pool behind
//! a mutex. Score application is one `IMMEDIATE` transaction: the
//! `score_records` insert is the idempotency guard and the `players` update
//! only happens when that insert created a row.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use super::backend::{BackendError, CommitOutcome, LedgerBackend, Player, ScoreRecord};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS players (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        player_name TEXT UNIQUE NOT NULL,
        score INTEGER NOT NULL DEFAULT 0,
        matches_played INTEGER NOT NULL DEFAULT 0,
        highest_score INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS score_records (
        match_id TEXT NOT NULL,
        player_name TEXT NOT NULL,
        delta INTEGER NOT NULL,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY (match_id, player_name)
    );
    CREATE INDEX IF NOT EXISTS players_scoreboard ON players (score DESC, id ASC);
";

const PLAYER_COLUMNS: &str = "id, player_name, score, matches_played, highest_score, created_at";

#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the database file and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened SQLite ledger");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BackendError> {
        conn.busy_timeout(Duration::from_secs(2))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| BackendError::Task(e.to_string()))?
    }
}

fn player_from_row(row: &Row<'_>) -> rusqlite::Result<Player> {
    Ok(Player {
        id: row.get(0)?,
        player_name: row.get(1)?,
        score: row.get(2)?,
        matches_played: row.get(3)?,
        highest_score: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn select_player(conn: &Connection, name: &str) -> Result<Option<Player>, BackendError> {
    let sql = format!("SELECT {} FROM players WHERE player_name = ?1", PLAYER_COLUMNS);
    Ok(conn
        .query_row(&sql, params![name], player_from_row)
        .optional()?)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl LedgerBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn register(&self, name: &str) -> Result<Player, BackendError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO players (player_name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now()],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Err(BackendError::Conflict(name)),
                Err(e) => return Err(e.into()),
            }
            select_player(conn, &name)?.ok_or(BackendError::UnknownPlayer(name))
        })
        .await
    }

    async fn ensure_player(&self, name: &str) -> Result<Player, BackendError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO players (player_name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now()],
            )?;
            select_player(conn, &name)?.ok_or(BackendError::UnknownPlayer(name))
        })
        .await
    }

    async fn player(&self, name: &str) -> Result<Option<Player>, BackendError> {
        let name = name.to_string();
        self.with_conn(move |conn| select_player(conn, &name)).await
    }

    async fn apply(&self, record: &ScoreRecord) -> Result<CommitOutcome, BackendError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO score_records (match_id, player_name, delta, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.match_id.to_string(),
                    record.player_id,
                    record.delta,
                    record.recorded_at
                ],
            )?;
            if inserted == 0 {
                return Ok(CommitOutcome::Duplicate);
            }

            let updated = tx.execute(
                "UPDATE players
                 SET score = score + ?1,
                     matches_played = matches_played + 1,
                     highest_score = MAX(highest_score, ?1)
                 WHERE player_name = ?2",
                params![record.delta, record.player_id],
            )?;
            if updated == 0 {
                // dropping the transaction rolls back the score_records row
                return Err(BackendError::UnknownPlayer(record.player_id));
            }

            tx.commit()?;
            Ok(CommitOutcome::Applied)
        })
        .await
    }

    async fn top(&self, limit: usize) -> Result<Vec<Player>, BackendError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM players ORDER BY score DESC, id ASC LIMIT ?1",
                PLAYER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let players = stmt
                .query_map(params![limit], player_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(players)
        })
        .await
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA optimize;")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn register_then_conflict() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let alice = backend.register("alice").await.unwrap();
        assert_eq!(alice.player_name, "alice");
        assert_eq!(alice.score, 0);
        assert!(matches!(
            backend.register("alice").await,
            Err(BackendError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn ensure_player_is_idempotent() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let first = backend.ensure_player("bob").await.unwrap();
        let second = backend.ensure_player("bob").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn apply_twice_counts_once_and_tracks_highest() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.register("alice").await.unwrap();

        let first = ScoreRecord::new("alice", 10, Uuid::new_v4());
        assert_eq!(backend.apply(&first).await.unwrap(), CommitOutcome::Applied);
        assert_eq!(backend.apply(&first).await.unwrap(), CommitOutcome::Duplicate);
        backend
            .apply(&ScoreRecord::new("alice", 4, Uuid::new_v4()))
            .await
            .unwrap();

        let alice = backend.player("alice").await.unwrap().unwrap();
        assert_eq!(alice.score, 14);
        assert_eq!(alice.matches_played, 2);
        assert_eq!(alice.highest_score, 10);
    }

    #[tokio::test]
    async fn unknown_player_leaves_no_record_behind() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let record = ScoreRecord::new("ghost", 3, Uuid::new_v4());
        assert!(matches!(
            backend.apply(&record).await,
            Err(BackendError::UnknownPlayer(_))
        ));

        // once the player exists the same record still applies
        backend.register("ghost").await.unwrap();
        assert_eq!(backend.apply(&record).await.unwrap(), CommitOutcome::Applied);
    }

    #[tokio::test]
    async fn replay_after_reopen_is_not_double_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let record = ScoreRecord::new("alice", 10, Uuid::new_v4());

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.register("alice").await.unwrap();
            backend.apply(&record).await.unwrap();
        }

        let reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(
            reopened.apply(&record).await.unwrap(),
            CommitOutcome::Duplicate
        );
        assert_eq!(reopened.player("alice").await.unwrap().unwrap().score, 10);
    }

    #[tokio::test]
    async fn top_orders_by_score_then_registration() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for name in ["alice", "bob", "carol"] {
            backend.register(name).await.unwrap();
        }
        let match_id = Uuid::new_v4();
        backend.apply(&ScoreRecord::new("carol", 7, match_id)).await.unwrap();
        backend.apply(&ScoreRecord::new("bob", 7, match_id)).await.unwrap();

        let names: Vec<String> = backend
            .top(2)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.player_name)
            .collect();
        assert_eq!(names, vec!["bob", "carol"]);
    }
}
