//! Two-player room: join handshake, ordered relay and match finalization.
//!
//! A room is owned by its own task. Every state transition and every
//! forwarded envelope happens on that task, so the room needs no locks; the
//! rest of the server talks to it through [`RoomHandle`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{ScoreLedger, ScoreRecord};
use crate::ws::connection::{Connection, ConnectionError};
use crate::ws::protocol::{
    parse_final_scores, ConnectionId, Envelope, MatchResultStatus, MessageKind, ProtocolError,
    RoomId, MAX_SCORE,
};

/// Room lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Both players assigned, waiting for their JOINs
    Waiting,
    /// Relay open
    Active,
    /// Ended by GAME_OVER
    Finished,
    /// Ended by anything else
    Aborted,
}

impl RoomState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a room was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    JoinTimeout,
    IdleTimeout,
    Disconnected,
    PlayerLeft,
    ProtocolViolation,
    Shutdown,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinTimeout => "join_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::Disconnected => "opponent_disconnected",
            Self::PlayerLeft => "opponent_left",
            Self::ProtocolViolation => "protocol_violation",
            Self::Shutdown => "server_shutdown",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-room timeouts and policies
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub join_timeout: Duration,
    pub idle_timeout: Duration,
    /// Protocol errors tolerated per player; one more aborts the room
    pub max_protocol_errors: u32,
    /// Commit accumulated SCORE_UPDATE deltas when an active match aborts
    pub partial_credit: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(120),
            max_protocol_errors: 5,
            partial_credit: false,
        }
    }
}

/// Commands delivered to a room task from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomCommand {
    /// A socket owned by this room went away
    ConnectionLost(ConnectionId),
    /// Process is draining
    Shutdown,
}

/// Cheap, cloneable view of a running room
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub id: RoomId,
    pub players: [String; 2],
    pub connection_ids: [ConnectionId; 2],
    control_tx: mpsc::UnboundedSender<RoomCommand>,
    state_rx: watch::Receiver<RoomState>,
}

impl RoomHandle {
    pub fn state(&self) -> RoomState {
        *self.state_rx.borrow()
    }

    /// Deliver a command; false once the room task has ended
    pub fn command(&self, command: RoomCommand) -> bool {
        self.control_tx.send(command).is_ok()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<RoomState> {
        self.state_rx.clone()
    }
}

/// What is left once a room task ends
#[derive(Debug)]
pub struct RoomOutcome {
    pub room_id: RoomId,
    pub state: RoomState,
    pub reason: Option<AbortReason>,
    pub connection_ids: [ConnectionId; 2],
    /// Blameless survivors to hand back to matchmaking
    pub requeue: Vec<Connection>,
}

struct Seat {
    conn: Connection,
    joined: bool,
    tally: i64,
    protocol_errors: u32,
}

impl Seat {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            joined: false,
            tally: 0,
            protocol_errors: 0,
        }
    }
}

enum Event {
    Inbound(usize, Result<Envelope, ConnectionError>),
    Command(Option<RoomCommand>),
    Deadline,
}

/// What the room does after handling an event
enum Step {
    Continue,
    Abort(AbortReason, Option<usize>),
    Finish(BTreeMap<String, i64>),
}

/// Room state machine, consumed by [`Room::run`]
pub struct Room {
    id: RoomId,
    seats: [Seat; 2],
    state: RoomState,
    next_seq: u64,
    deadline: Instant,
    settings: RoomSettings,
    ledger: Arc<ScoreLedger>,
    control_rx: mpsc::UnboundedReceiver<RoomCommand>,
    state_tx: watch::Sender<RoomState>,
}

impl Room {
    pub fn new(
        a: Connection,
        b: Connection,
        settings: RoomSettings,
        ledger: Arc<ScoreLedger>,
    ) -> (Self, RoomHandle) {
        let id = Uuid::new_v4();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RoomState::Waiting);

        let handle = RoomHandle {
            id,
            players: [a.player_id().to_string(), b.player_id().to_string()],
            connection_ids: [a.id(), b.id()],
            control_tx,
            state_rx,
        };

        let room = Self {
            id,
            seats: [Seat::new(a), Seat::new(b)],
            state: RoomState::Waiting,
            next_seq: 1,
            deadline: Instant::now() + settings.join_timeout,
            settings,
            ledger,
            control_rx,
            state_tx,
        };

        (room, handle)
    }

    fn player(&self, seat: usize) -> &str {
        self.seats[seat].conn.player_id()
    }

    fn set_state(&mut self, state: RoomState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Drive the room until it reaches a terminal state
    pub async fn run(mut self) -> RoomOutcome {
        info!(
            room_id = %self.id,
            player_a = %self.player(0),
            player_b = %self.player(1),
            "Room opened"
        );

        self.deadline = Instant::now() + self.settings.join_timeout;
        for seat in 0..2 {
            // anything buffered so far predates this room
            let stale = self.seats[seat].conn.discard_pending();
            if stale > 0 {
                debug!(room_id = %self.id, player = %self.player(seat), stale, "Discarded stale envelopes");
            }
        }
        for seat in 0..2 {
            let opponent = self.player(1 - seat).to_string();
            let assigned = Envelope::room_assigned(self.id, &opponent);
            if self.seats[seat].conn.send(assigned).await.is_err() {
                return self.abort(AbortReason::Disconnected, Some(seat)).await;
            }
        }

        loop {
            let event = {
                let [a, b] = &mut self.seats;
                tokio::select! {
                    command = self.control_rx.recv() => Event::Command(command),
                    msg = a.conn.receive() => Event::Inbound(0, msg),
                    msg = b.conn.receive() => Event::Inbound(1, msg),
                    _ = sleep_until(self.deadline) => Event::Deadline,
                }
            };

            let step = match event {
                Event::Inbound(seat, Ok(envelope)) => self.on_envelope(seat, envelope).await,
                Event::Inbound(seat, Err(e)) => {
                    debug!(room_id = %self.id, player = %self.player(seat), error = %e, "Seat lost");
                    Step::Abort(AbortReason::Disconnected, Some(seat))
                }
                Event::Command(Some(RoomCommand::ConnectionLost(id))) => {
                    match self.seats.iter().position(|s| s.conn.id() == id) {
                        Some(seat) => Step::Abort(AbortReason::Disconnected, Some(seat)),
                        None => Step::Continue,
                    }
                }
                Event::Command(Some(RoomCommand::Shutdown)) | Event::Command(None) => {
                    Step::Abort(AbortReason::Shutdown, None)
                }
                Event::Deadline => match self.state {
                    RoomState::Waiting => Step::Abort(AbortReason::JoinTimeout, None),
                    _ => self.on_idle_deadline(),
                },
            };

            match step {
                Step::Continue => {}
                Step::Abort(reason, culprit) => return self.abort(reason, culprit).await,
                Step::Finish(scores) => return self.finish(scores).await,
            }
        }
    }

    async fn on_envelope(&mut self, seat: usize, mut envelope: Envelope) -> Step {
        if envelope.room_id.is_some_and(|room_id| room_id != self.id) {
            debug!(
                room_id = %self.id,
                player = %self.player(seat),
                kind = %envelope.kind,
                "Dropped envelope addressed to another room"
            );
            return Step::Continue;
        }

        if self.state == RoomState::Active {
            self.deadline = Instant::now() + self.settings.idle_timeout;
        }

        match (envelope.kind, self.state) {
            (MessageKind::Ping, _) => self.reply(seat, Envelope::pong(envelope.payload)).await,

            (MessageKind::Leave, _) => {
                info!(room_id = %self.id, player = %self.player(seat), "Player left room");
                Step::Abort(AbortReason::PlayerLeft, Some(seat))
            }

            // reader pump reports a malformed frame
            (MessageKind::Error, _) => {
                let reply = Envelope::new(MessageKind::Error, envelope.payload).in_room(self.id);
                self.protocol_error(seat, reply).await
            }

            (MessageKind::Join, RoomState::Waiting) => {
                if self.seats[seat].joined {
                    debug!(room_id = %self.id, player = %self.player(seat), "Duplicate JOIN ignored");
                    return Step::Continue;
                }
                self.seats[seat].joined = true;
                if self.seats.iter().all(|s| s.joined) {
                    self.set_state(RoomState::Active);
                    self.deadline = Instant::now() + self.settings.idle_timeout;
                    info!(room_id = %self.id, "Room active");
                }
                Step::Continue
            }

            (kind, RoomState::Active) if kind.is_relayed() => {
                if kind == MessageKind::ScoreUpdate {
                    if let Some(delta) = envelope.score_delta() {
                        let tally = self.seats[seat]
                            .tally
                            .checked_add(delta)
                            .filter(|t| (-MAX_SCORE..=MAX_SCORE).contains(t));
                        match tally {
                            Some(tally) => self.seats[seat].tally = tally,
                            None => {
                                let err = ProtocolError::InvalidScores(format!(
                                    "score delta {} puts the tally out of range",
                                    delta
                                ));
                                return self
                                    .protocol_error(seat, err.to_envelope().in_room(self.id))
                                    .await;
                            }
                        }
                    }
                }
                envelope.seq = self.next_seq;
                envelope.room_id = Some(self.id);
                self.next_seq += 1;

                let other = 1 - seat;
                match self.seats[other].conn.send(envelope).await {
                    Ok(()) => Step::Continue,
                    Err(_) => Step::Abort(AbortReason::Disconnected, Some(other)),
                }
            }

            (MessageKind::GameOver, RoomState::Active) => {
                let players = [self.player(0), self.player(1)];
                match parse_final_scores(&envelope.payload, &players) {
                    Ok(scores) => Step::Finish(scores),
                    Err(e) => self.protocol_error(seat, e.to_envelope().in_room(self.id)).await,
                }
            }

            (kind, _) if !kind.is_client_kind() => {
                let err = ProtocolError::ServerOnly(kind);
                self.protocol_error(seat, err.to_envelope().in_room(self.id))
                    .await
            }

            (kind, state) => {
                let err = ProtocolError::Unexpected {
                    kind,
                    state: state.as_str(),
                };
                self.protocol_error(seat, err.to_envelope().in_room(self.id))
                    .await
            }
        }
    }

    /// Socket-level keepalives count as traffic, so the idle deadline is
    /// pushed out from the most recent frame either player sent.
    fn on_idle_deadline(&mut self) -> Step {
        let resume = self
            .seats
            .iter()
            .map(|s| s.conn.last_activity())
            .max()
            .map(|last| last + self.settings.idle_timeout);
        match resume {
            Some(at) if at > Instant::now() => {
                self.deadline = at;
                Step::Continue
            }
            _ => Step::Abort(AbortReason::IdleTimeout, None),
        }
    }

    async fn reply(&self, seat: usize, envelope: Envelope) -> Step {
        match self.seats[seat].conn.send(envelope.in_room(self.id)).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Abort(AbortReason::Disconnected, Some(seat)),
        }
    }

    async fn protocol_error(&mut self, seat: usize, error: Envelope) -> Step {
        let count = {
            let s = &mut self.seats[seat];
            s.protocol_errors += 1;
            s.protocol_errors
        };
        warn!(
            room_id = %self.id,
            player = %self.player(seat),
            errors = count,
            payload = %error.payload,
            "Protocol error"
        );

        if let Step::Abort(reason, culprit) = self.reply(seat, error).await {
            return Step::Abort(reason, culprit);
        }
        if count > self.settings.max_protocol_errors {
            return Step::Abort(AbortReason::ProtocolViolation, Some(seat));
        }
        Step::Continue
    }

    async fn finish(mut self, scores: BTreeMap<String, i64>) -> RoomOutcome {
        self.set_state(RoomState::Finished);

        let records = scores
            .iter()
            .map(|(player, delta)| ScoreRecord::new(player.clone(), *delta, self.id))
            .collect();
        let status = match self.ledger.commit_match(self.id, records).await {
            Ok(_) => MatchResultStatus::Committed,
            Err(e) => {
                warn!(room_id = %self.id, error = %e, "Match result not persisted");
                MatchResultStatus::Unresolved
            }
        };

        let result = Envelope::match_result(self.id, &scores, status);
        for seat in &self.seats {
            let _ = seat.conn.send(result.clone()).await;
            seat.conn.close();
        }

        info!(room_id = %self.id, ?scores, ?status, "Room finished");
        RoomOutcome {
            room_id: self.id,
            state: self.state,
            reason: None,
            connection_ids: self.connection_ids(),
            requeue: Vec::new(),
        }
    }

    /// Tear the room down. `culprit` is the seat that caused the abort, if
    /// any; it is closed while a blameless survivor goes back to matchmaking.
    async fn abort(mut self, reason: AbortReason, culprit: Option<usize>) -> RoomOutcome {
        let was_active = self.state == RoomState::Active;
        self.set_state(RoomState::Aborted);
        info!(room_id = %self.id, reason = %reason, "Room aborted");

        if was_active && self.settings.partial_credit {
            self.commit_partial_credit().await;
        }

        let leave = Envelope::leave(self.id, reason.as_str());
        let mut keep = [false; 2];
        for (i, seat) in self.seats.iter().enumerate() {
            let requeue = match reason {
                AbortReason::JoinTimeout => seat.joined,
                AbortReason::Disconnected
                | AbortReason::PlayerLeft
                | AbortReason::ProtocolViolation => culprit != Some(i),
                AbortReason::IdleTimeout | AbortReason::Shutdown => false,
            };
            let silent = reason == AbortReason::JoinTimeout && !seat.joined;

            if culprit == Some(i) || silent {
                seat.conn.close();
                continue;
            }

            let delivered = seat.conn.send(leave.clone()).await.is_ok();
            if requeue && delivered && seat.conn.is_alive() {
                keep[i] = true;
            } else {
                seat.conn.close();
            }
        }

        let connection_ids = self.connection_ids();
        let mut requeue: Vec<Connection> = self
            .seats
            .into_iter()
            .zip(keep)
            .filter_map(|(seat, keep)| keep.then_some(seat.conn))
            .collect();
        for conn in &mut requeue {
            let stale = conn.discard_pending();
            info!(room_id = %self.id, player = %conn.player_id(), stale, "Returning player to queue");
        }

        RoomOutcome {
            room_id: self.id,
            state: self.state,
            reason: Some(reason),
            connection_ids,
            requeue,
        }
    }

    async fn commit_partial_credit(&self) {
        let records: Vec<ScoreRecord> = self
            .seats
            .iter()
            .map(|s| ScoreRecord::new(s.conn.player_id(), s.tally, self.id))
            .collect();
        if let Err(e) = self.ledger.commit_match(self.id, records).await {
            warn!(room_id = %self.id, error = %e, "Partial credit not persisted");
        }
    }

    fn connection_ids(&self) -> [ConnectionId; 2] {
        [self.seats[0].conn.id(), self.seats[1].conn.id()]
    }
}
