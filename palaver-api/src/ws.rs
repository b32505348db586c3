//! WebSocket signaling endpoint.
//!
//! Each connection carries JSON text frames. Inbound frames are
//! request/acknowledgement envelopes: `{"seq": n, "request": {...}}`,
//! acknowledged with `{"type": "ack", "seq": n, "result": ...}`. The `seq`
//! is the acknowledgement correlation — a frame that cannot carry one
//! (malformed JSON, missing seq, a binary payload) is a protocol
//! violation and the connection is closed. Server-initiated events are
//! pushed as `{"type": "event", "event": {...}}`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use palaver_core::peer::EventSink;
use palaver_core::signaling::{ClientRequest, ServerEvent};
use palaver_core::SessionHub;

use crate::AppState;

/// Outbound queue depth per connection. A client that cannot drain this
/// many frames is too slow; further pushes are dropped and logged.
const OUTBOUND_QUEUE: usize = 256;

/// Signaling frames are small; anything bigger than this is not ours.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Inbound request envelope.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    seq: u64,
    request: ClientRequest,
}

/// Outbound frame: an acknowledgement or a server-initiated event.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Ack { seq: u64, result: serde_json::Value },
    Event { event: ServerEvent },
}

/// Event sink feeding the connection's outbound queue.
struct QueueSink {
    tx: tokio::sync::mpsc::Sender<String>,
}

impl QueueSink {
    fn push(&self, frame: &ServerFrame) -> Result<(), String> {
        let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
        self.tx.try_send(text).map_err(|e| match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => {
                "outbound queue full: client too slow".to_string()
            }
            tokio::sync::mpsc::error::TrySendError::Closed(_) => {
                "outbound queue closed: client disconnected".to_string()
            }
        })
    }
}

impl EventSink for QueueSink {
    fn deliver(&self, event: ServerEvent) -> Result<(), String> {
        self.push(&ServerFrame::Event { event })
    }
}

/// WebSocket handler for the signaling channel.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<SessionHub>) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(OUTBOUND_QUEUE);
    let sink = Arc::new(QueueSink { tx: tx.clone() });

    let peer = hub.connect(sink).await;
    let peer_id = peer.id;

    info!(peer_id = %peer_id, "signaling connection established");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drains the outbound queue into the socket. Ends when
    // every sender is gone or the socket dies.
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                debug!(peer_id = %peer_id, "socket write failed: {e}");
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                debug!(peer_id = %peer_id, frame = %text, "=>");

                let envelope: RequestEnvelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        // No usable acknowledgement correlation: the
                        // caller cannot receive results, so it cannot be
                        // trusted with the rest of the protocol.
                        error!(peer_id = %peer_id, "protocol violation, disconnecting: {e}");
                        break;
                    }
                };

                let result = match hub.handle_request(peer_id, envelope.request).await {
                    Ok(ack) => match serde_json::to_value(&ack) {
                        Ok(value) => value,
                        Err(e) => {
                            error!(peer_id = %peer_id, "failed to encode ack: {e}");
                            json!({ "error": "internal error" })
                        }
                    },
                    Err(e) => {
                        warn!(peer_id = %peer_id, "request failed: {e}");
                        json!({ "error": e.to_string() })
                    }
                };

                let frame = ServerFrame::Ack {
                    seq: envelope.seq,
                    result,
                };
                debug!(peer_id = %peer_id, ?frame, "<=");
                if let Err(e) = serde_json::to_string(&frame)
                    .map_err(|e| e.to_string())
                    .and_then(|text| tx.try_send(text).map_err(|e| e.to_string()))
                {
                    warn!(peer_id = %peer_id, "failed to queue ack, disconnecting: {e}");
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                error!(peer_id = %peer_id, "binary frame on signaling channel, disconnecting");
                break;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Ping/pong, handled by the transport.
            }
            Err(e) => {
                debug!(peer_id = %peer_id, "socket read failed: {e}");
                break;
            }
        }
    }

    hub.disconnect(peer_id).await;
    info!(peer_id = %peer_id, "signaling connection closed");

    // Dropping our queue handles lets the writer task drain and exit.
    drop(tx);
    drop(peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_requires_seq() {
        let valid: Result<RequestEnvelope, _> =
            serde_json::from_str(r#"{"seq": 3, "request": {"type": "capabilities"}}"#);
        assert!(valid.is_ok());
        assert_eq!(valid.unwrap().seq, 3);

        let missing_seq: Result<RequestEnvelope, _> =
            serde_json::from_str(r#"{"request": {"type": "capabilities"}}"#);
        assert!(missing_seq.is_err());

        let garbage: Result<RequestEnvelope, _> = serde_json::from_str("not json");
        assert!(garbage.is_err());
    }

    #[test]
    fn test_ack_frame_shape() {
        let frame = ServerFrame::Ack {
            seq: 9,
            result: json!({ "success": true }),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["seq"], 9);
        assert_eq!(value["result"]["success"], true);
    }

    #[test]
    fn test_event_frame_shape() {
        let frame = ServerFrame::Event {
            event: ServerEvent::PeerLeft {
                room: "lobby".to_string(),
                peer_id: palaver_core::ids::PeerId(4),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["type"], "peer_left");
        assert_eq!(value["event"]["peer_id"], 4);
    }
}
