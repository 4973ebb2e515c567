//! Matchmaking queue implementation

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::ws::connection::Connection;
use crate::ws::protocol::ConnectionId;

/// Connection waiting for an opponent
#[derive(Debug)]
pub struct QueuedPlayer {
    pub connection: Connection,
    pub queued_at: Instant,
}

impl QueuedPlayer {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            queued_at: Instant::now(),
        }
    }

    /// How long this player has been waiting
    pub fn wait_time(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

/// Strict FIFO of waiting connections
#[derive(Debug, Default)]
pub struct MatchmakingQueue {
    queue: VecDeque<QueuedPlayer>,
}

impl MatchmakingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection at the back of the queue
    pub fn enqueue(&mut self, connection: Connection) {
        self.queue.push_back(QueuedPlayer::new(connection));
    }

    /// Remove a connection from the queue
    pub fn dequeue(&mut self, id: ConnectionId) -> Option<Connection> {
        let pos = self.queue.iter().position(|p| p.connection.id() == id)?;
        self.queue.remove(pos).map(|p| p.connection)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.queue.iter().any(|p| p.connection.id() == id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn pop_live(&mut self) -> Option<QueuedPlayer> {
        while let Some(player) = self.queue.pop_front() {
            if player.connection.is_alive() {
                return Some(player);
            }
            debug!(player = %player.connection.player_id(), "Skipping dead queue entry");
        }
        None
    }

    /// Take the two longest-waiting live connections, if there are two
    pub fn try_pair(&mut self) -> Option<(Connection, Connection)> {
        let first = self.pop_live()?;
        match self.pop_live() {
            Some(second) => {
                debug!(
                    first_wait_ms = first.wait_time().as_millis() as u64,
                    second_wait_ms = second.wait_time().as_millis() as u64,
                    "Paired queued players"
                );
                Some((first.connection, second.connection))
            }
            None => {
                self.queue.push_front(first);
                None
            }
        }
    }

    /// Drop entries whose socket has gone away; returns how many
    pub fn sweep(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|p| p.connection.is_alive());
        before - self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::{ConnectionSettings, Transport};

    fn conn(name: &str) -> (Connection, Transport) {
        Connection::open(name, &ConnectionSettings::default())
    }

    #[test]
    fn pairs_in_arrival_order() {
        let mut queue = MatchmakingQueue::new();
        let (alice, _a) = conn("alice");
        let (bob, _b) = conn("bob");
        let (carol, _c) = conn("carol");
        queue.enqueue(alice);
        queue.enqueue(bob);
        queue.enqueue(carol);

        let (first, second) = queue.try_pair().unwrap();
        assert_eq!(first.player_id(), "alice");
        assert_eq!(second.player_id(), "bob");
        assert!(queue.try_pair().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn dead_entries_are_skipped_when_pairing() {
        let mut queue = MatchmakingQueue::new();
        let (alice, _a) = conn("alice");
        let (bob, bob_t) = conn("bob");
        let (carol, _c) = conn("carol");
        queue.enqueue(alice);
        queue.enqueue(bob);
        queue.enqueue(carol);
        bob_t.inbound.mark_closed();

        let (first, second) = queue.try_pair().unwrap();
        assert_eq!(first.player_id(), "alice");
        assert_eq!(second.player_id(), "carol");
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_and_sweep_remove_entries() {
        let mut queue = MatchmakingQueue::new();
        let (alice, _a) = conn("alice");
        let (bob, bob_t) = conn("bob");
        let alice_id = alice.id();
        queue.enqueue(alice);
        queue.enqueue(bob);

        assert!(queue.contains(alice_id));
        assert_eq!(queue.dequeue(alice_id).unwrap().player_id(), "alice");
        assert!(queue.dequeue(alice_id).is_none());

        bob_t.inbound.mark_closed();
        assert_eq!(queue.sweep(), 1);
        assert!(queue.is_empty());
    }
}
