//! Socket pumps: move frames between a WebSocket and a connection's transport half

use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::util::rate_limit::InboundRateLimiter;

use super::connection::InboundPort;
use super::protocol::{decode_client_frame, Envelope, ProtocolError};

/// Read frames from the socket into the connection until either side closes.
///
/// Malformed frames become ERROR envelopes for the room. Marks the connection
/// closed on exit so the room and the writer observe the disconnect.
pub async fn run_reader<St, E>(mut stream: St, port: &InboundPort, limiter: InboundRateLimiter)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let id = port.id();
    let mut closed = port.closed_signal();

    loop {
        let frame = tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            frame = stream.next() => frame,
        };

        let envelope = match frame {
            Some(Ok(Message::Text(text))) => {
                port.touch();
                if !limiter.check() {
                    warn!(connection_id = %id, player = %port.player_id(), "Rate limited inbound message");
                    continue;
                }
                match decode_client_frame(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Failed to parse client message");
                        e.to_envelope()
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                port.touch();
                warn!(connection_id = %id, "Received binary message");
                ProtocolError::BinaryFrame.to_envelope()
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                port.touch();
                continue;
            }
            Some(Ok(Message::Close(_))) => {
                info!(connection_id = %id, player = %port.player_id(), "Client initiated close");
                break;
            }
            Some(Err(e)) => {
                warn!(connection_id = %id, error = %e, "WebSocket error");
                break;
            }
            None => break,
        };

        if port.push(envelope).await.is_err() {
            debug!(connection_id = %id, "Inbound channel closed");
            break;
        }
    }

    port.mark_closed();
}

/// Write queued envelopes to the socket.
///
/// On close, whatever is already queued is flushed within `flush_deadline`
/// and a close frame is sent.
pub async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Envelope>,
    mut closed: watch::Receiver<bool>,
    flush_deadline: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(envelope) => {
                    if let Err(e) = write_envelope(&mut sink, &envelope).await {
                        debug!(error = %e, "WebSocket send failed");
                        return;
                    }
                }
                None => break,
            },
            // the watch::Ref must not live across the arm body awaits
            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                let flush = async {
                    while let Ok(envelope) = outbound.try_recv() {
                        if write_envelope(&mut sink, &envelope).await.is_err() {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(flush_deadline, flush).await.is_err() {
                    warn!("Flush deadline passed, dropping queued messages");
                }
                break;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn write_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = envelope.to_text().map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::{Connection, ConnectionSettings};
    use crate::ws::protocol::MessageKind;
    use futures::channel::mpsc as fmpsc;
    use serde_json::json;

    fn text(s: &str) -> Result<Message, String> {
        Ok(Message::Text(s.to_string()))
    }

    #[tokio::test]
    async fn reader_turns_frames_into_envelopes_and_errors() {
        let (mut conn, transport) = Connection::open("alice", &ConnectionSettings::default());
        let frames = futures::stream::iter(vec![
            text(r#"{"type":"JOIN"}"#),
            text("{oops"),
            Ok(Message::Binary(vec![1, 2, 3])),
            text(r#"{"type":"MOVE","payload":{"x":1}}"#),
        ]);

        run_reader(frames, &transport.inbound, InboundRateLimiter::new(100)).await;

        let join = conn.receive().await.unwrap();
        assert_eq!(join.kind, MessageKind::Join);
        assert_eq!(join.origin, Some(conn.id()));

        let malformed = conn.receive().await.unwrap();
        assert_eq!(malformed.kind, MessageKind::Error);
        assert_eq!(malformed.payload["code"], "malformed");

        let binary = conn.receive().await.unwrap();
        assert_eq!(binary.payload["code"], "binary_frame");

        assert_eq!(conn.receive().await.unwrap().payload, json!({"x": 1}));
        assert!(conn.receive().await.is_err());
    }

    #[tokio::test]
    async fn reader_drops_messages_over_the_rate_limit() {
        let (mut conn, transport) = Connection::open("alice", &ConnectionSettings::default());
        let frames = futures::stream::iter((0..5).map(|_| text(r#"{"type":"PING"}"#)));

        run_reader(frames, &transport.inbound, InboundRateLimiter::new(2)).await;

        let mut received = 0;
        while conn.receive().await.is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn writer_flushes_queued_envelopes_on_close() {
        let (conn, transport) = Connection::open("alice", &ConnectionSettings::default());
        let closed = transport.closed_signal();
        let (sink, mut socket) = fmpsc::unbounded::<Message>();

        conn.send(Envelope::new(MessageKind::Move, json!(1))).await.unwrap();
        conn.send(Envelope::new(MessageKind::Move, json!(2))).await.unwrap();
        conn.close();

        run_writer(sink, transport.outbound, closed, Duration::from_secs(1)).await;

        let mut payloads = Vec::new();
        while let Some(frame) = socket.next().await {
            match frame {
                Message::Text(text) => {
                    let env: Envelope = serde_json::from_str(&text).unwrap();
                    payloads.push(env.payload);
                }
                Message::Close(_) => break,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(payloads, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn writer_runs_on_its_own_task_until_closed() {
        let (conn, transport) = Connection::open("alice", &ConnectionSettings::default());
        let (sink, mut socket) = fmpsc::unbounded::<Message>();
        let writer = tokio::spawn(run_writer(
            sink,
            transport.outbound,
            transport.inbound.closed_signal(),
            Duration::from_secs(1),
        ));

        conn.send(Envelope::new(MessageKind::Pong, json!({ "t": 1 })))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), socket.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Text(text) if text.contains("PONG")));

        conn.close();
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer did not stop after close")
            .unwrap();
        assert!(matches!(socket.next().await, Some(Message::Close(None))));
    }
}
