//! Live player connection: bounded outbound queue, inbound queue and close signal.
//!
//! A [`Connection`] is the room-facing half. It is moved between owners (the
//! matchmaking queue, then a room) and never shared. The socket-facing half is
//! the [`Transport`], driven by the reader/writer pumps in [`super::pump`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{ConnectionId, Envelope};

/// Buffer sizes and deadlines for one connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Outbound envelopes buffered before `send` starts waiting
    pub outbound_buffer: usize,
    /// How long `send` waits on a full buffer before giving up on the peer
    pub backpressure_grace: Duration,
    /// Best-effort flush deadline on close
    pub close_flush: Duration,
    /// Inbound messages allowed per second
    pub inbound_rate_limit: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            backpressure_grace: Duration::from_millis(500),
            close_flush: Duration::from_secs(1),
            inbound_rate_limit: 30,
        }
    }
}

/// Connection errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("outbound buffer full, slow consumer disconnected")]
    Backpressure,
}

/// State shared by both halves of a connection
#[derive(Debug)]
struct Shared {
    id: ConnectionId,
    player_id: String,
    alive: AtomicBool,
    last_activity: Mutex<Instant>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn close(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        self.closed_tx.send_replace(true);
        was_alive
    }
}

/// Room-facing half of a live socket
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Envelope>,
    inbound: mpsc::Receiver<Envelope>,
    closed_rx: watch::Receiver<bool>,
    backpressure_grace: Duration,
}

/// Socket-facing half, consumed by the pumps
pub struct Transport {
    /// Feeds the connection's inbound queue (reader pump)
    pub inbound: InboundPort,
    /// Drains the connection's outbound queue (writer pump)
    pub outbound: mpsc::Receiver<Envelope>,
}

/// Writing end of the inbound queue plus the shared connection state
pub struct InboundPort {
    shared: Arc<Shared>,
    sender: mpsc::Sender<Envelope>,
}

/// Cloneable handle that can observe or force-close a connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection for `player_id` together with its transport half
    pub fn open(player_id: impl Into<String>, settings: &ConnectionSettings) -> (Self, Transport) {
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_buffer.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.outbound_buffer.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            player_id: player_id.into(),
            alive: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            closed_tx,
        });

        let connection = Self {
            shared: shared.clone(),
            outbound: outbound_tx,
            inbound: inbound_rx,
            closed_rx,
            backpressure_grace: settings.backpressure_grace,
        };

        let transport = Transport {
            inbound: InboundPort {
                shared,
                sender: inbound_tx,
            },
            outbound: outbound_rx,
        };

        (connection, transport)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn player_id(&self) -> &str {
        &self.shared.player_id
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// When the socket last delivered a frame of any kind
    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Queue an envelope for delivery.
    ///
    /// Waits at most the backpressure grace period when the buffer is full;
    /// past that the connection is closed and `Backpressure` is returned.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::Closed);
        }

        let envelope = match self.outbound.try_send(envelope) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.close();
                return Err(ConnectionError::Closed);
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => envelope,
        };

        match self
            .outbound
            .send_timeout(envelope, self.backpressure_grace)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(
                    connection_id = %self.id(),
                    player = %self.player_id(),
                    "Outbound buffer stayed full, closing slow consumer"
                );
                self.shared.close();
                Err(ConnectionError::Backpressure)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.shared.close();
                Err(ConnectionError::Closed)
            }
        }
    }

    /// Next inbound envelope, or `Closed` once the connection is gone.
    ///
    /// Envelopes already buffered are delivered before the closed signal.
    pub async fn receive(&mut self) -> Result<Envelope, ConnectionError> {
        tokio::select! {
            biased;
            msg = self.inbound.recv() => msg.ok_or(ConnectionError::Closed),
            _ = self.closed_rx.wait_for(|closed| *closed) => {
                self.inbound.try_recv().map_err(|_| ConnectionError::Closed)
            }
        }
    }

    /// Drop inbound envelopes already buffered, returning how many
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.inbound.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Mark the connection dead; the writer pump flushes what is queued and
    /// closes the socket.
    pub fn close(&self) {
        if self.shared.close() {
            debug!(connection_id = %self.id(), player = %self.player_id(), "Connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn player_id(&self) -> &str {
        &self.shared.player_id
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl InboundPort {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn player_id(&self) -> &str {
        &self.shared.player_id
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *self.shared.last_activity.lock() = Instant::now();
    }

    /// Hand an envelope to the connection, stamped with its origin
    pub async fn push(&self, mut envelope: Envelope) -> Result<(), ConnectionError> {
        envelope.origin = Some(self.shared.id);
        self.sender
            .send(envelope)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Receiver that resolves once either side closes the connection
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    /// Peer went away
    pub fn mark_closed(&self) {
        self.shared.close();
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Transport {
    pub fn id(&self) -> ConnectionId {
        self.inbound.id()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inbound.closed_signal()
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.inbound.handle()
    }
}
