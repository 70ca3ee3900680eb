//! Signaling transport: the single bidirectional channel to the rendezvous
//! server. All room membership and connection negotiation flows through it;
//! only the media payloads bypass it once a peer link is up.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub name: String,
    pub email: String,
}

impl ParticipantInfo {
    /// Human-facing name: the display name when present, the email otherwise,
    /// each word capitalized. Empty info renders as "Guest".
    pub fn display_name(&self) -> String {
        let source = if self.name.trim().is_empty() {
            &self.email
        } else {
            &self.name
        };
        if source.trim().is_empty() {
            return "Guest".to_string();
        }
        source
            .split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedPeer {
    pub connection_id: String,
    pub participant: ParticipantInfo,
}

/// One negotiation step for a single peer link. The transport relays these
/// verbatim; only the two link endpoints interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    /// JSON-serialized ICE candidate init, kept as a string so the payload
    /// stays opaque on the wire.
    Candidate { candidate: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Server handshake: the transport-assigned connection id for this
    /// client. Always the first frame after the websocket opens.
    Connected {
        connection_id: String,
    },
    JoinRoomRequest {
        room_id: String,
        participant: ParticipantInfo,
    },
    /// Server -> host: someone asked to join and is now waiting.
    WaitingUser {
        connection_id: String,
        participant: ParticipantInfo,
    },
    /// Host -> server: admit a waiting participant.
    ApproveUser {
        room_id: String,
        connection_id_to_approve: String,
    },
    /// Server -> newly approved participant: the current approved roster.
    ApprovedToJoin {
        approved_participants: Vec<ApprovedPeer>,
    },
    /// Server -> newly approved participant: already-joined peers it should
    /// answer to.
    ExistingPeers {
        peers: Vec<ApprovedPeer>,
    },
    /// Server -> already-joined participants: initiate toward this peer.
    NewUserApproved {
        connection_id: String,
        participant: ParticipantInfo,
    },
    /// Newly approved participant -> server, once its responder links are set
    /// up.
    NewUserJoined {
        room_id: String,
        participant: ParticipantInfo,
    },
    Signal {
        to: String,
        from: String,
        signal: SignalPayload,
    },
    UserDisconnected {
        connection_id: String,
    },
}

/// Outbound half of the transport. The coordinator only ever sends through
/// this seam, which keeps it testable without a live server.
#[async_trait]
pub trait SignalingSender: Send + Sync {
    async fn send(&self, msg: SignalingMessage) -> Result<()>;
}

pub struct SignalingClient {
    tx: mpsc::Sender<SignalingMessage>,
}

impl SignalingClient {
    /// Connects, waits for the server's `connected` handshake, and spawns the
    /// read/write pumps. Returns the client, the inbound message stream, and
    /// the connection id the transport assigned to us.
    ///
    /// When the returned receiver yields `None` the websocket is gone; that is
    /// fatal to the room session and requires a fresh join.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<SignalingMessage>, String)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let connection_id = loop {
            let frame = read.next().await.ok_or(Error::ConnectionLost)??;
            let Message::Text(text) = frame else { continue };
            match serde_json::from_str::<SignalingMessage>(&text)? {
                SignalingMessage::Connected { connection_id } => break connection_id,
                other => {
                    return Err(Error::Signaling(format!(
                        "expected connected handshake, got {:?}",
                        other
                    )))
                }
            }
        };
        debug!("signaling connected as {}", connection_id);

        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<SignalingMessage>(100);

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("failed to encode signaling message: {}", e),
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("websocket read failed: {}", e);
                        break;
                    }
                };
                let Message::Text(text) = frame else { continue };
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(msg) => {
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Unknown vocabulary is dropped, not surfaced.
                    Err(e) => debug!("dropping unparseable signaling frame: {}", e),
                }
            }
        });

        Ok((Self { tx: outgoing_tx }, incoming_rx, connection_id))
    }
}

#[async_trait]
impl SignalingSender for SignalingClient {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| Error::ConnectionLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_request_wire_format() {
        let msg = SignalingMessage::JoinRoomRequest {
            room_id: "r1".into(),
            participant: ParticipantInfo {
                name: "ada".into(),
                email: "ada@example.com".into(),
            },
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["event"], "join-room-request");
        assert_eq!(json["roomId"], "r1");
        assert_eq!(json["participant"]["email"], "ada@example.com");
    }

    #[test]
    fn approve_user_uses_camel_case_fields() {
        let msg = SignalingMessage::ApproveUser {
            room_id: "r1".into(),
            connection_id_to_approve: "c9".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["event"], "approve-user");
        assert_eq!(json["connectionIdToApprove"], "c9");
    }

    #[test]
    fn signal_payload_round_trips() {
        let msg = SignalingMessage::Signal {
            to: "b".into(),
            from: "a".into(),
            signal: SignalPayload::Offer { sdp: "v=0".into() },
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"event\":\"signal\""));
        let decoded: SignalingMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn server_events_decode_by_kebab_case_name() {
        let decoded: SignalingMessage = serde_json::from_str(
            r#"{"event":"user-disconnected","connectionId":"c3"}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            SignalingMessage::UserDisconnected { connection_id: "c3".into() }
        );
    }

    #[test]
    fn display_name_capitalizes_words() {
        let info = ParticipantInfo {
            name: "ada lovelace".into(),
            email: "ada@example.com".into(),
        };
        assert_eq!(info.display_name(), "Ada Lovelace");

        let email_only = ParticipantInfo {
            name: "".into(),
            email: "bob@example.com".into(),
        };
        assert_eq!(email_only.display_name(), "Bob@example.com");

        let empty = ParticipantInfo { name: "".into(), email: " ".into() };
        assert_eq!(empty.display_name(), "Guest");
    }
}
