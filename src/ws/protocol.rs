//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Identifies one live socket
pub type ConnectionId = Uuid;

/// Identifies a room; also used as the match id in the ledger
pub type RoomId = Uuid;

/// Largest magnitude accepted for a final score or a running tally
pub const MAX_SCORE: i64 = 1_000_000_000;

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Player is ready; both JOINs open the relay
    Join,
    /// Game move, relayed verbatim
    Move,
    /// In-match score change, relayed verbatim
    ScoreUpdate,
    /// Player left (client) or opponent left (server)
    Leave,
    /// Protocol error report
    Error,
    /// Latency probe
    Ping,
    /// Reply to a ping
    Pong,
    /// Match ended, payload carries final scores
    GameOver,
    /// Sent to both players on pairing
    RoomAssigned,
    /// Sent to both players once the result has been recorded
    MatchResult,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "JOIN",
            Self::Move => "MOVE",
            Self::ScoreUpdate => "SCORE_UPDATE",
            Self::Leave => "LEAVE",
            Self::Error => "ERROR",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::GameOver => "GAME_OVER",
            Self::RoomAssigned => "ROOM_ASSIGNED",
            Self::MatchResult => "MATCH_RESULT",
        }
    }

    /// Whether a client is allowed to send this kind
    pub fn is_client_kind(self) -> bool {
        matches!(
            self,
            Self::Join | Self::Move | Self::ScoreUpdate | Self::Leave | Self::Ping | Self::GameOver
        )
    }

    /// Kinds the room forwards to the opponent with a sequence number
    pub fn is_relayed(self) -> bool {
        matches!(self, Self::Move | Self::ScoreUpdate)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit relayed within a room.
///
/// On the wire: `{"type": "MOVE", "seq": 1, "roomId": "...", "payload": {...}}`.
/// `seq` and `roomId` are optional on input and ignored; the room assigns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub payload: Value,
    /// Connection that produced this envelope (server-side only)
    #[serde(skip)]
    pub origin: Option<ConnectionId>,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self {
            kind,
            seq: 0,
            room_id: None,
            payload,
            origin: None,
        }
    }

    pub fn in_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn room_assigned(room_id: RoomId, opponent_id: &str) -> Self {
        Self::new(
            MessageKind::RoomAssigned,
            json!({ "roomId": room_id, "opponentId": opponent_id }),
        )
        .in_room(room_id)
    }

    pub fn leave(room_id: RoomId, reason: &str) -> Self {
        Self::new(MessageKind::Leave, json!({ "reason": reason })).in_room(room_id)
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(MessageKind::Error, json!({ "code": code, "message": message }))
    }

    pub fn pong(payload: Value) -> Self {
        Self::new(MessageKind::Pong, payload)
    }

    pub fn match_result(
        room_id: RoomId,
        scores: &BTreeMap<String, i64>,
        status: MatchResultStatus,
    ) -> Self {
        Self::new(
            MessageKind::MatchResult,
            json!({ "scores": scores, "status": status }),
        )
        .in_room(room_id)
    }

    /// Score delta carried by a SCORE_UPDATE, if any
    pub fn score_delta(&self) -> Option<i64> {
        self.payload.get("delta").and_then(Value::as_i64)
    }

    /// Encode for a text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome reported in MATCH_RESULT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResultStatus {
    /// Both score records are durable
    Committed,
    /// The ledger write failed; kept for manual reconciliation
    Unresolved,
}

/// Malformed or unexpected client input
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("{0} may only be sent by the server")]
    ServerOnly(MessageKind),

    #[error("{kind} is not allowed while the room is {state}")]
    Unexpected { kind: MessageKind, state: &'static str },

    #[error("invalid final scores: {0}")]
    InvalidScores(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::BinaryFrame => "binary_frame",
            Self::ServerOnly(_) => "server_only",
            Self::Unexpected { .. } => "unexpected",
            Self::InvalidScores(_) => "invalid_scores",
        }
    }

    /// ERROR envelope carrying this error to the room or the client
    pub fn to_envelope(&self) -> Envelope {
        Envelope::error(self.code(), &self.to_string())
    }
}

/// Decode a text frame sent by a client
pub fn decode_client_frame(text: &str) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if !envelope.kind.is_client_kind() {
        return Err(ProtocolError::ServerOnly(envelope.kind));
    }

    Ok(envelope)
}

/// Extract `{"scores": {"alice": 10, "bob": 7}}` from a GAME_OVER payload,
/// requiring an integer score within [`MAX_SCORE`] for every listed player.
pub fn parse_final_scores(
    payload: &Value,
    players: &[&str],
) -> Result<BTreeMap<String, i64>, ProtocolError> {
    let scores = payload
        .get("scores")
        .and_then(Value::as_object)
        .ok_or_else(|| ProtocolError::InvalidScores("missing scores object".to_string()))?;

    let mut result = BTreeMap::new();
    for player in players {
        let score = scores
            .get(*player)
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::InvalidScores(format!("no score for {}", player)))?;
        if !(-MAX_SCORE..=MAX_SCORE).contains(&score) {
            return Err(ProtocolError::InvalidScores(format!(
                "score for {} out of range",
                player
            )));
        }
        result.insert((*player).to_string(), score);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_client_move() {
        let env = decode_client_frame(r#"{"type":"MOVE","payload":{"x":1}}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Move);
        assert_eq!(env.seq, 0);
        assert_eq!(env.room_id, None);
        assert_eq!(env.payload, json!({"x": 1}));
    }

    #[test]
    fn join_without_payload_decodes_to_null_payload() {
        let env = decode_client_frame(r#"{"type":"JOIN"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Join);
        assert!(env.payload.is_null());
    }

    #[test]
    fn rejects_garbage_and_unknown_types() {
        assert!(matches!(
            decode_client_frame("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_client_frame(r#"{"type":"TELEPORT"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_server_only_kinds_from_clients() {
        let err = decode_client_frame(r#"{"type":"MATCH_RESULT","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::ServerOnly(MessageKind::MatchResult));
        assert_eq!(err.code(), "server_only");
    }

    #[test]
    fn wire_format_uses_camel_case_room_id_and_type_tag() {
        let room_id = Uuid::new_v4();
        let mut env = Envelope::new(MessageKind::ScoreUpdate, json!({"delta": 3})).in_room(room_id);
        env.seq = 4;
        env.origin = Some(Uuid::new_v4());

        let value: Value = serde_json::from_str(&env.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "SCORE_UPDATE");
        assert_eq!(value["seq"], 4);
        assert_eq!(value["roomId"], room_id.to_string());
        assert!(value.get("origin").is_none());
        assert_eq!(env.score_delta(), Some(3));
    }

    #[test]
    fn room_assigned_names_the_opponent() {
        let room_id = Uuid::new_v4();
        let env = Envelope::room_assigned(room_id, "bob");
        assert_eq!(env.payload["opponentId"], "bob");
        assert_eq!(env.payload["roomId"], room_id.to_string());
    }

    #[test]
    fn final_scores_must_cover_every_player() {
        let payload = json!({"scores": {"alice": 10, "bob": 7}});
        let scores = parse_final_scores(&payload, &["alice", "bob"]).unwrap();
        assert_eq!(scores["alice"], 10);
        assert_eq!(scores["bob"], 7);

        let partial = json!({"scores": {"alice": 10}});
        assert!(matches!(
            parse_final_scores(&partial, &["alice", "bob"]),
            Err(ProtocolError::InvalidScores(_))
        ));
        assert!(parse_final_scores(&json!({}), &["alice"]).is_err());
    }

    #[test]
    fn final_scores_out_of_range_are_rejected() {
        let huge = json!({"scores": {"alice": i64::MAX, "bob": 7}});
        assert!(parse_final_scores(&json!({"scores": {"alice": 1, "bob": i64::MIN}}), &["alice", "bob"]).is_err());
        assert!(matches!(
            parse_final_scores(&huge, &["alice", "bob"]),
            Err(ProtocolError::InvalidScores(_))
        ));

        let edge = json!({"scores": {"alice": MAX_SCORE, "bob": -MAX_SCORE}});
        assert!(parse_final_scores(&edge, &["alice", "bob"]).is_ok());
    }
}
