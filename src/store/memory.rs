//! In-process ledger backend for tests and throwaway servers

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::backend::{BackendError, CommitOutcome, LedgerBackend, Player, ScoreRecord};

#[derive(Default)]
struct MemoryState {
    players: HashMap<String, Player>,
    next_id: i64,
    applied: HashSet<(Uuid, String)>,
}

/// Map-backed store.
///
/// `apply` loads the player, yields, then stores the updated row, like a
/// remote read-modify-write. Concurrent writers for one player must be
/// serialized by the caller.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    #[cfg(test)]
    failures: std::sync::atomic::AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` applies fail with a transient error
    #[cfg(test)]
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_failure(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> bool {
        false
    }

    fn insert_player(state: &mut MemoryState, name: &str) -> Player {
        state.next_id += 1;
        let player = Player {
            id: state.next_id,
            player_name: name.to_string(),
            score: 0,
            matches_played: 0,
            highest_score: 0,
            created_at: Utc::now(),
        };
        state.players.insert(name.to_string(), player.clone());
        player
    }
}

#[async_trait]
impl LedgerBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, name: &str) -> Result<Player, BackendError> {
        let mut state = self.state.lock();
        if state.players.contains_key(name) {
            return Err(BackendError::Conflict(name.to_string()));
        }
        Ok(Self::insert_player(&mut state, name))
    }

    async fn ensure_player(&self, name: &str) -> Result<Player, BackendError> {
        let mut state = self.state.lock();
        match state.players.get(name) {
            Some(player) => Ok(player.clone()),
            None => Ok(Self::insert_player(&mut state, name)),
        }
    }

    async fn player(&self, name: &str) -> Result<Option<Player>, BackendError> {
        Ok(self.state.lock().players.get(name).cloned())
    }

    async fn apply(&self, record: &ScoreRecord) -> Result<CommitOutcome, BackendError> {
        if self.injected_failure() {
            return Err(BackendError::Unavailable);
        }

        let key = (record.match_id, record.player_id.clone());
        let current = {
            let state = self.state.lock();
            if state.applied.contains(&key) {
                return Ok(CommitOutcome::Duplicate);
            }
            state.players.get(&record.player_id).cloned()
        };
        let mut player = current.ok_or_else(|| BackendError::UnknownPlayer(record.player_id.clone()))?;

        tokio::task::yield_now().await;

        player.score = player
            .score
            .checked_add(record.delta)
            .ok_or_else(|| BackendError::ScoreOverflow(record.player_id.clone()))?;
        player.matches_played += 1;
        player.highest_score = player.highest_score.max(record.delta);

        let mut state = self.state.lock();
        state.applied.insert(key);
        state.players.insert(record.player_id.clone(), player);
        Ok(CommitOutcome::Applied)
    }

    async fn top(&self, limit: usize) -> Result<Vec<Player>, BackendError> {
        let mut players: Vec<Player> = self.state.lock().players.values().cloned().collect();
        players.sort_by(|a, b| b.score.cmp(&a.score).then(a.id.cmp(&b.id)));
        players.truncate(limit);
        Ok(players)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_rejects_duplicate_names() {
        let backend = MemoryBackend::new();
        backend.register("alice").await.unwrap();
        assert!(matches!(
            backend.register("alice").await,
            Err(BackendError::Conflict(name)) if name == "alice"
        ));
    }

    #[tokio::test]
    async fn apply_is_idempotent_per_match_and_player() {
        let backend = MemoryBackend::new();
        backend.register("alice").await.unwrap();
        let record = ScoreRecord::new("alice", 12, Uuid::new_v4());

        assert_eq!(backend.apply(&record).await.unwrap(), CommitOutcome::Applied);
        assert_eq!(backend.apply(&record).await.unwrap(), CommitOutcome::Duplicate);

        let alice = backend.player("alice").await.unwrap().unwrap();
        assert_eq!(alice.score, 12);
        assert_eq!(alice.matches_played, 1);
        assert_eq!(alice.highest_score, 12);
    }

    #[tokio::test]
    async fn top_breaks_ties_by_registration_order() {
        let backend = MemoryBackend::new();
        for name in ["carol", "alice", "bob"] {
            backend.register(name).await.unwrap();
        }
        let match_id = Uuid::new_v4();
        backend.apply(&ScoreRecord::new("bob", 5, match_id)).await.unwrap();
        backend.apply(&ScoreRecord::new("alice", 5, match_id)).await.unwrap();

        let names: Vec<String> = backend
            .top(10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.player_name)
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn apply_that_would_overflow_leaves_the_player_untouched() {
        let backend = MemoryBackend::new();
        backend.register("alice").await.unwrap();
        backend
            .apply(&ScoreRecord::new("alice", i64::MAX, Uuid::new_v4()))
            .await
            .unwrap();

        let err = backend
            .apply(&ScoreRecord::new("alice", 1, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ScoreOverflow(_)));
        assert!(!err.is_transient());

        let alice = backend.player("alice").await.unwrap().unwrap();
        assert_eq!(alice.score, i64::MAX);
        assert_eq!(alice.matches_played, 1);
    }

    #[tokio::test]
    async fn apply_for_unknown_player_is_rejected() {
        let backend = MemoryBackend::new();
        let err = backend
            .apply(&ScoreRecord::new("ghost", 1, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownPlayer(_)));
        assert!(!err.is_transient());
    }
}
