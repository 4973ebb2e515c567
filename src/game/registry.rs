//! Room registry: live rooms by id plus the connection -> room index

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::store::ScoreLedger;
use crate::ws::connection::Connection;
use crate::ws::protocol::{ConnectionId, RoomId};

use super::room::{Room, RoomCommand, RoomHandle, RoomOutcome, RoomSettings, RoomState};

/// Tracks every live room and routes connection events to it
pub struct RoomRegistry {
    rooms: DashMap<RoomId, RoomHandle>,
    by_connection: DashMap<ConnectionId, RoomId>,
    ledger: Arc<ScoreLedger>,
    settings: RoomSettings,
    /// Survivors of aborted rooms go back to the matchmaker
    requeue_tx: mpsc::UnboundedSender<Connection>,
    closing: AtomicBool,
    drained: Notify,
}

impl RoomRegistry {
    pub fn new(
        ledger: Arc<ScoreLedger>,
        settings: RoomSettings,
        requeue_tx: mpsc::UnboundedSender<Connection>,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            by_connection: DashMap::new(),
            ledger,
            settings,
            requeue_tx,
            closing: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Pair two connections into a new room and start its task.
    ///
    /// Returns `None` once shutdown has begun; both connections are closed.
    pub fn open_room(self: &Arc<Self>, a: Connection, b: Connection) -> Option<RoomId> {
        if self.closing.load(Ordering::Acquire) {
            a.close();
            b.close();
            return None;
        }

        let (room, handle) = Room::new(a, b, self.settings.clone(), self.ledger.clone());
        let room_id = handle.id;
        let connection_ids = handle.connection_ids;

        for connection_id in handle.connection_ids {
            self.by_connection.insert(connection_id, room_id);
        }
        info!(
            room_id = %room_id,
            players = ?handle.players,
            active_rooms = self.rooms.len() + 1,
            "Created new room"
        );
        self.rooms.insert(room_id, handle);
        self.supervise(room_id, connection_ids, room.run());

        Some(room_id)
    }

    /// Run a room task and always clean up after it, even if it panics
    fn supervise<F>(self: &Arc<Self>, room_id: RoomId, connection_ids: [ConnectionId; 2], run: F)
    where
        F: Future<Output = RoomOutcome> + Send + 'static,
    {
        let task = tokio::spawn(run);
        let registry = self.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // the room's connections were dropped with the task and are closed
                    error!(room_id = %room_id, error = %e, "Room task failed");
                    RoomOutcome {
                        room_id,
                        state: RoomState::Aborted,
                        reason: None,
                        connection_ids,
                        requeue: Vec::new(),
                    }
                }
            };
            registry.finish(outcome);
        });
    }

    fn finish(&self, outcome: RoomOutcome) {
        debug_assert!(outcome.state.is_terminal());
        let room_id = outcome.room_id;
        for connection_id in outcome.connection_ids {
            self.by_connection
                .remove_if(&connection_id, |_, owner| *owner == room_id);
        }
        self.rooms.remove(&room_id);

        for conn in outcome.requeue {
            if let Err(mpsc::error::SendError(conn)) = self.requeue_tx.send(conn) {
                warn!(player = %conn.player_id(), "Matchmaker gone, closing survivor");
                conn.close();
            }
        }

        info!(room_id = %room_id, state = %outcome.state, "Room removed from registry");
        self.drained.notify_one();
    }

    /// Route a socket loss to the room that owns the connection
    pub fn connection_lost(&self, connection_id: ConnectionId) -> bool {
        let Some(room_id) = self.room_of(connection_id) else {
            return false;
        };
        match self.get(room_id) {
            Some(handle) => handle.command(RoomCommand::ConnectionLost(connection_id)),
            None => false,
        }
    }

    pub fn room_of(&self, connection_id: ConnectionId) -> Option<RoomId> {
        self.by_connection.get(&connection_id).map(|r| *r.value())
    }

    pub fn get(&self, room_id: RoomId) -> Option<RoomHandle> {
        self.rooms.get(&room_id).map(|r| r.value().clone())
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Abort every room and wait up to `deadline` for them to finish.
    /// Returns whether all rooms drained in time.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.closing.store(true, Ordering::Release);

        let handles: Vec<RoomHandle> = self.rooms.iter().map(|r| r.value().clone()).collect();
        info!(rooms = handles.len(), "Draining rooms");
        for handle in &handles {
            handle.command(RoomCommand::Shutdown);
        }

        let drained = tokio::time::timeout(deadline, async {
            while !self.rooms.is_empty() {
                self.drained.notified().await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(remaining = self.rooms.len(), "Rooms still open after drain deadline");
        }
        drained
    }
}
