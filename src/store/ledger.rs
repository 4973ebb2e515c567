//! Score ledger: serialized, idempotent score commits over a storage backend

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::util::time::backoff_delay;

use super::backend::{BackendError, CommitOutcome, LedgerBackend, Player, ScoreRecord};

/// Upper bound on a single retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Timeouts and retry policy for ledger writes
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Bound on waiting for a player's lock and on each backend call
    pub write_timeout: Duration,
    /// Attempts before a write is reported as a persistence failure
    pub max_attempts: u32,
    /// First retry delay, doubled on every further attempt
    pub retry_backoff: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
            max_attempts: 4,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Ledger errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("player name already taken: {0}")]
    Conflict(String),

    #[error("unknown player: {0}")]
    UnknownPlayer(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("ledger write failed after {attempts} attempts: {reason}")]
    PersistenceFailure { attempts: u32, reason: String },

    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for LedgerError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Conflict(name) => Self::Conflict(name),
            BackendError::UnknownPlayer(name) => Self::UnknownPlayer(name),
            other => Self::Backend(other),
        }
    }
}

/// A finished match whose scores could not be persisted
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedMatch {
    pub match_id: Uuid,
    pub records: Vec<ScoreRecord>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable player scoreboard.
///
/// Commits for the same player are serialized under a per-player lock, so
/// a backend that does read-modify-write never loses an update; commits for
/// different players never wait on each other.
pub struct ScoreLedger {
    backend: Arc<dyn LedgerBackend>,
    settings: LedgerSettings,
    player_locks: DashMap<String, Arc<Mutex<()>>>,
    unresolved: DashMap<Uuid, UnresolvedMatch>,
}

impl ScoreLedger {
    pub fn new(backend: Arc<dyn LedgerBackend>, settings: LedgerSettings) -> Self {
        Self {
            backend,
            settings,
            player_locks: DashMap::new(),
            unresolved: DashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Register a new player; `Conflict` if the name is taken
    pub async fn register(&self, name: &str) -> Result<Player, LedgerError> {
        let player = self
            .bounded("player registration", self.backend.register(name))
            .await?;
        info!(player = %name, id = player.id, "Registered player");
        Ok(player)
    }

    /// Create the player if it does not exist yet
    pub async fn ensure_player(&self, name: &str) -> Result<Player, LedgerError> {
        self.bounded("player lookup", self.backend.ensure_player(name))
            .await
    }

    /// Current score snapshot for one player
    pub async fn read(&self, name: &str) -> Result<Option<Player>, LedgerError> {
        self.bounded("player lookup", self.backend.player(name)).await
    }

    /// Scoreboard: score descending, ties by earliest registration
    pub async fn top_n(&self, n: usize) -> Result<Vec<Player>, LedgerError> {
        self.bounded("scoreboard", self.backend.top(n)).await
    }

    async fn bounded<T, F>(&self, what: &'static str, fut: F) -> Result<T, LedgerError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        timeout(self.settings.write_timeout, fut)
            .await
            .map_err(|_| LedgerError::Timeout(what))?
            .map_err(LedgerError::from)
    }

    fn player_lock(&self, player: &str) -> Arc<Mutex<()>> {
        self.player_locks
            .entry(player.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply one score record.
    ///
    /// Replaying a record (same match and player) returns `Duplicate` and
    /// leaves the score alone. Transient failures and timed-out attempts are
    /// retried with backoff; past the attempt budget the write surfaces as
    /// `PersistenceFailure`.
    pub async fn commit(&self, record: &ScoreRecord) -> Result<CommitOutcome, LedgerError> {
        let lock = self.player_lock(&record.player_id);
        let result = match timeout(self.settings.write_timeout, lock.lock()).await {
            Ok(_guard) => self.commit_locked(record).await,
            Err(_) => Err(LedgerError::Timeout("player lock")),
        };
        drop(lock);

        // the map holds the only reference once no commit is running or waiting
        self.player_locks
            .remove_if(&record.player_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn commit_locked(&self, record: &ScoreRecord) -> Result<CommitOutcome, LedgerError> {

        let mut attempt = 0;
        loop {
            attempt += 1;

            let reason = match timeout(self.settings.write_timeout, self.backend.apply(record)).await
            {
                Ok(Ok(outcome)) => {
                    info!(
                        player = %record.player_id,
                        match_id = %record.match_id,
                        delta = record.delta,
                        outcome = ?outcome,
                        "Score record committed"
                    );
                    return Ok(outcome);
                }
                Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "write timed out".to_string(),
            };

            if attempt >= self.settings.max_attempts {
                error!(
                    player = %record.player_id,
                    match_id = %record.match_id,
                    attempts = attempt,
                    reason = %reason,
                    "Giving up on score record"
                );
                return Err(LedgerError::PersistenceFailure {
                    attempts: attempt,
                    reason,
                });
            }

            let delay = self.retry_delay(attempt - 1);
            warn!(
                player = %record.player_id,
                match_id = %record.match_id,
                attempt,
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "Ledger write failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = backoff_delay(self.settings.retry_backoff, attempt, MAX_RETRY_DELAY);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }

    /// Commit every record of a match concurrently.
    ///
    /// If any record fails the match is kept as unresolved for manual
    /// reconciliation and the first error is returned.
    pub async fn commit_match(
        &self,
        match_id: Uuid,
        records: Vec<ScoreRecord>,
    ) -> Result<Vec<CommitOutcome>, LedgerError> {
        let results = futures::future::join_all(records.iter().map(|r| self.commit(r))).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(err) = failure {
            error!(match_id = %match_id, error = %err, "Match result left unresolved");
            self.unresolved.insert(
                match_id,
                UnresolvedMatch {
                    match_id,
                    records,
                    reason: err.to_string(),
                    failed_at: Utc::now(),
                },
            );
            return Err(err);
        }

        self.unresolved.remove(&match_id);
        Ok(outcomes)
    }

    /// Matches awaiting reconciliation, oldest first
    pub fn unresolved(&self) -> Vec<UnresolvedMatch> {
        let mut matches: Vec<UnresolvedMatch> =
            self.unresolved.iter().map(|m| m.value().clone()).collect();
        matches.sort_by_key(|m| m.failed_at);
        matches
    }

    /// Re-commit an unresolved match. Already applied records come back as
    /// `Duplicate`, so a partially written match is completed, not doubled.
    pub async fn reconcile(&self, match_id: Uuid) -> Result<Option<Vec<CommitOutcome>>, LedgerError> {
        let records = match self.unresolved.get(&match_id) {
            Some(entry) => entry.records.clone(),
            None => return Ok(None),
        };
        info!(match_id = %match_id, "Reconciling unresolved match");
        self.commit_match(match_id, records).await.map(Some)
    }

    /// Flush and release the backend
    pub async fn close(&self) -> Result<(), LedgerError> {
        let pending = self.unresolved.len();
        if pending > 0 {
            warn!(pending, "Closing ledger with unresolved matches");
        }
        self.backend.close().await.map_err(LedgerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio_test::assert_ok;

    fn settings() -> LedgerSettings {
        LedgerSettings {
            write_timeout: Duration::from_secs(1),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn ledger_with(players: &[&str]) -> (Arc<MemoryBackend>, ScoreLedger) {
        let backend = Arc::new(MemoryBackend::new());
        for name in players {
            backend.register(name).await.unwrap();
        }
        let ledger = ScoreLedger::new(backend.clone(), settings());
        (backend, ledger)
    }

    #[tokio::test]
    async fn commit_twice_with_same_match_counts_once() {
        let (_, ledger) = ledger_with(&["alice"]).await;
        let record = ScoreRecord::new("alice", 10, Uuid::new_v4());

        assert_eq!(assert_ok!(ledger.commit(&record).await), CommitOutcome::Applied);
        assert_eq!(assert_ok!(ledger.commit(&record).await), CommitOutcome::Duplicate);

        let alice = ledger.read("alice").await.unwrap().unwrap();
        assert_eq!(alice.score, 10);
        assert_eq!(alice.matches_played, 1);
    }

    #[tokio::test]
    async fn concurrent_commits_for_one_player_lose_nothing() {
        let (_, ledger) = ledger_with(&["alice"]).await;
        let ledger = Arc::new(ledger);

        let tasks: Vec<_> = (1..=50)
            .map(|delta| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .commit(&ScoreRecord::new("alice", delta, Uuid::new_v4()))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let alice = ledger.read("alice").await.unwrap().unwrap();
        assert_eq!(alice.score, (1..=50).sum::<i64>());
        assert_eq!(alice.matches_played, 50);
        assert!(ledger.player_locks.is_empty());
    }

    #[tokio::test]
    async fn player_locks_are_released_after_each_commit() {
        let (_, ledger) = ledger_with(&["alice", "bob"]).await;
        let match_id = Uuid::new_v4();

        assert_ok!(
            ledger
                .commit_match(
                    match_id,
                    vec![
                        ScoreRecord::new("alice", 3, match_id),
                        ScoreRecord::new("bob", 1, match_id),
                    ],
                )
                .await
        );
        assert!(ledger.commit(&ScoreRecord::new("ghost", 1, match_id)).await.is_err());
        assert!(ledger.player_locks.is_empty());
    }

    /// Holds every apply for one player until released
    struct GatedBackend {
        inner: MemoryBackend,
        gated_player: String,
        gate: Notify,
    }

    #[async_trait]
    impl LedgerBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn register(&self, name: &str) -> Result<Player, BackendError> {
            self.inner.register(name).await
        }

        async fn ensure_player(&self, name: &str) -> Result<Player, BackendError> {
            self.inner.ensure_player(name).await
        }

        async fn player(&self, name: &str) -> Result<Option<Player>, BackendError> {
            self.inner.player(name).await
        }

        async fn apply(&self, record: &ScoreRecord) -> Result<CommitOutcome, BackendError> {
            if record.player_id == self.gated_player {
                self.gate.notified().await;
            }
            self.inner.apply(record).await
        }

        async fn top(&self, limit: usize) -> Result<Vec<Player>, BackendError> {
            self.inner.top(limit).await
        }
    }

    #[tokio::test]
    async fn commits_for_different_players_do_not_block_each_other() {
        let backend = Arc::new(GatedBackend {
            inner: MemoryBackend::new(),
            gated_player: "alice".to_string(),
            gate: Notify::new(),
        });
        backend.register("alice").await.unwrap();
        backend.register("bob").await.unwrap();
        let ledger = Arc::new(ScoreLedger::new(
            backend.clone(),
            LedgerSettings {
                write_timeout: Duration::from_secs(5),
                ..settings()
            },
        ));

        let stalled = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .commit(&ScoreRecord::new("alice", 3, Uuid::new_v4()))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let bob = tokio::time::timeout(
            Duration::from_secs(1),
            ledger.commit(&ScoreRecord::new("bob", 4, Uuid::new_v4())),
        )
        .await
        .expect("bob waited on alice");
        assert_eq!(bob.unwrap(), CommitOutcome::Applied);
        assert!(!stalled.is_finished());

        backend.gate.notify_one();
        assert_eq!(stalled.await.unwrap().unwrap(), CommitOutcome::Applied);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (backend, ledger) = ledger_with(&["alice"]).await;
        backend.fail_next(2);

        let outcome = ledger
            .commit(&ScoreRecord::new("alice", 5, Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Applied);
        assert_eq!(ledger.read("alice").await.unwrap().unwrap().score, 5);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_match_unresolved_until_reconciled() {
        let (backend, ledger) = ledger_with(&["alice", "bob"]).await;
        let match_id = Uuid::new_v4();
        let records = vec![
            ScoreRecord::new("alice", 10, match_id),
            ScoreRecord::new("bob", 7, match_id),
        ];

        backend.fail_next(10);
        let err = ledger.commit_match(match_id, records).await.unwrap_err();
        assert!(matches!(err, LedgerError::PersistenceFailure { .. }));

        let unresolved = ledger.unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].match_id, match_id);

        backend.fail_next(0);
        let outcomes = ledger.reconcile(match_id).await.unwrap().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(ledger.unresolved().is_empty());
        assert_eq!(ledger.read("alice").await.unwrap().unwrap().score, 10);
        assert_eq!(ledger.read("bob").await.unwrap().unwrap().score, 7);
    }

    #[tokio::test]
    async fn unknown_player_is_not_retried() {
        let (_, ledger) = ledger_with(&[]).await;
        let err = ledger
            .commit(&ScoreRecord::new("ghost", 1, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownPlayer(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn register_conflict_surfaces_as_conflict() {
        let (_, ledger) = ledger_with(&["alice"]).await;
        assert!(matches!(
            ledger.register("alice").await,
            Err(LedgerError::Conflict(_))
        ));
    }
}
