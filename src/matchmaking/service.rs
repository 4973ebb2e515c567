//! Matchmaking service - manages the queue and hands pairs to the registry

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::game::RoomRegistry;
use crate::ws::connection::Connection;
use crate::ws::protocol::ConnectionId;

use super::queue::MatchmakingQueue;

/// How often dead queue entries are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Matchmaking service
pub struct Matchmaker {
    queue: Mutex<MatchmakingQueue>,
    registry: Arc<RoomRegistry>,
}

impl Matchmaker {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            queue: Mutex::new(MatchmakingQueue::new()),
            registry,
        }
    }

    /// Join the queue; pairs are formed as soon as two live players wait
    pub fn enqueue(&self, connection: Connection) {
        let connection_id = connection.id();
        let player = connection.player_id().to_string();

        let (pairs, queue_size) = {
            let mut queue = self.queue.lock();
            queue.enqueue(connection);
            let mut pairs = Vec::new();
            while let Some(pair) = queue.try_pair() {
                pairs.push(pair);
            }
            (pairs, queue.len())
        };

        info!(
            connection_id = %connection_id,
            player = %player,
            queue_size,
            "Player joined matchmaking queue"
        );

        for (a, b) in pairs {
            self.registry.open_room(a, b);
        }
    }

    /// Leave the queue. No-op if the connection was already paired or removed.
    pub fn cancel(&self, connection_id: ConnectionId) -> bool {
        let removed = self.queue.lock().dequeue(connection_id);
        match removed {
            Some(connection) => {
                debug!(connection_id = %connection_id, player = %connection.player_id(), "Left matchmaking queue");
                true
            }
            None => false,
        }
    }

    /// Get current queue size
    pub fn queue_size(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_queued(&self, connection_id: ConnectionId) -> bool {
        self.queue.lock().contains(connection_id)
    }

    /// Re-enqueue survivors returned by rooms and sweep dead entries.
    /// Ends when every registry sender is gone.
    pub async fn run(self: Arc<Self>, mut requeue_rx: mpsc::UnboundedReceiver<Connection>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                survivor = requeue_rx.recv() => match survivor {
                    Some(connection) => self.enqueue(connection),
                    None => break,
                },
                _ = sweep.tick() => {
                    let removed = self.queue.lock().sweep();
                    if removed > 0 {
                        debug!(removed, "Swept disconnected players from queue");
                    }
                }
            }
        }

        info!("Matchmaker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::room::RoomState;
    use crate::game::RoomSettings;
    use crate::store::{LedgerSettings, MemoryBackend, ScoreLedger};
    use crate::ws::connection::{ConnectionSettings, Transport};
    use crate::ws::protocol::{Envelope, MessageKind};

    fn matchmaker() -> (Arc<Matchmaker>, Arc<RoomRegistry>, mpsc::UnboundedReceiver<Connection>) {
        let ledger = Arc::new(ScoreLedger::new(
            Arc::new(MemoryBackend::new()),
            LedgerSettings::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RoomRegistry::new(ledger, RoomSettings::default(), tx));
        (Arc::new(Matchmaker::new(registry.clone())), registry, rx)
    }

    fn conn(name: &str) -> (Connection, Transport) {
        Connection::open(name, &ConnectionSettings::default())
    }

    async fn opponent_of(transport: &mut Transport) -> String {
        let env: Envelope = tokio::time::timeout(Duration::from_secs(1), transport.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.kind, MessageKind::RoomAssigned);
        env.payload["opponentId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn third_player_waits_for_the_next_arrival() {
        let (mm, registry, _rx) = matchmaker();
        let (alice, mut alice_t) = conn("alice");
        let (bob, _bob_t) = conn("bob");
        let (carol, mut carol_t) = conn("carol");
        let (dave, _dave_t) = conn("dave");
        let (alice_id, carol_id) = (alice.id(), carol.id());

        mm.enqueue(alice);
        mm.enqueue(bob);
        mm.enqueue(carol);

        assert_eq!(opponent_of(&mut alice_t).await, "bob");
        assert!(registry.room_of(alice_id).is_some());
        assert_eq!(mm.queue_size(), 1);
        assert!(mm.is_queued(carol_id));
        assert!(registry.room_of(carol_id).is_none());

        mm.enqueue(dave);
        assert_eq!(opponent_of(&mut carol_t).await, "dave");
        assert_eq!(mm.queue_size(), 0);
        assert_eq!(registry.active_rooms(), 2);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (mm, _registry, _rx) = matchmaker();
        let (alice, _alice_t) = conn("alice");
        let alice_id = alice.id();
        mm.enqueue(alice);

        assert!(mm.cancel(alice_id));
        assert!(!mm.cancel(alice_id));
        assert_eq!(mm.queue_size(), 0);
    }

    #[tokio::test]
    async fn dead_queued_player_is_never_paired() {
        let (mm, registry, _rx) = matchmaker();
        let (alice, alice_t) = conn("alice");
        let (bob, mut bob_t) = conn("bob");
        let (carol, _carol_t) = conn("carol");

        mm.enqueue(alice);
        alice_t.inbound.mark_closed();
        mm.enqueue(bob);
        assert_eq!(registry.active_rooms(), 0);

        mm.enqueue(carol);
        assert_eq!(opponent_of(&mut bob_t).await, "carol");
        assert_eq!(mm.queue_size(), 0);
    }

    #[tokio::test]
    async fn survivors_are_requeued_by_the_run_loop() {
        let (mm, registry, rx) = matchmaker();
        tokio::spawn(mm.clone().run(rx));

        let (alice, mut alice_t) = conn("alice");
        let (bob, bob_t) = conn("bob");
        let alice_id = alice.id();
        mm.enqueue(alice);
        mm.enqueue(bob);
        assert_eq!(opponent_of(&mut alice_t).await, "bob");

        bob_t.inbound.mark_closed();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !mm.is_queued(alice_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("survivor was not requeued");
        assert_eq!(registry.active_rooms(), 0);

        let (carol, _carol_t) = conn("carol");
        mm.enqueue(carol);
        let mut kinds = Vec::new();
        while kinds.last() != Some(&MessageKind::RoomAssigned) {
            let env = alice_t.outbound.recv().await.unwrap();
            kinds.push(env.kind);
        }
        assert_eq!(kinds, vec![MessageKind::Leave, MessageKind::RoomAssigned]);
    }

    async fn join_and_wait_active(registry: &RoomRegistry, players: [&Transport; 2], player: ConnectionId) {
        for t in players {
            t.inbound
                .push(Envelope::new(MessageKind::Join, serde_json::Value::Null))
                .await
                .unwrap();
        }
        let room_id = registry.room_of(player).unwrap();
        let mut state = registry.get(room_id).unwrap().watch_state();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == RoomState::Active),
        )
        .await
        .expect("room never became active")
        .unwrap();
    }

    #[tokio::test]
    async fn moves_in_flight_when_the_opponent_drops_do_not_follow_the_survivor() {
        let (mm, registry, rx) = matchmaker();
        tokio::spawn(mm.clone().run(rx));

        let (alice, mut alice_t) = conn("alice");
        let (bob, mut bob_t) = conn("bob");
        let alice_id = alice.id();
        mm.enqueue(alice);
        mm.enqueue(bob);
        assert_eq!(opponent_of(&mut alice_t).await, "bob");
        assert_eq!(opponent_of(&mut bob_t).await, "alice");
        join_and_wait_active(&registry, [&alice_t, &bob_t], alice_id).await;
        let first_room = registry.room_of(alice_id).unwrap();

        bob_t.inbound.mark_closed();
        for x in 0..8 {
            alice_t
                .inbound
                .push(Envelope::new(MessageKind::Move, serde_json::json!({ "x": x })))
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while !mm.is_queued(alice_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("survivor was not requeued");

        let (carol, mut carol_t) = conn("carol");
        mm.enqueue(carol);
        assert_eq!(opponent_of(&mut carol_t).await, "alice");
        loop {
            let env = tokio::time::timeout(Duration::from_secs(1), alice_t.outbound.recv())
                .await
                .unwrap()
                .unwrap();
            if env.kind == MessageKind::RoomAssigned {
                break;
            }
        }
        assert_ne!(registry.room_of(alice_id), Some(first_room));

        join_and_wait_active(&registry, [&alice_t, &carol_t], alice_id).await;
        assert!(alice_t.outbound.try_recv().is_err());
        assert!(carol_t.outbound.try_recv().is_err());
    }
}
