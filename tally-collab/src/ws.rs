//! WebSocket [`Connector`] for a fan-out relay.
//!
//! Each websocket binary message carries one bincode-encoded [`RelayFrame`]:
//! ```text
//! client ──► relay : Join | Leave | Message
//! relay  ──► client: Joined | ParticipantJoined | ParticipantLeft | Message
//! ```
//! The room is addressed by URL: `{server_url}/{document_id}`.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{ChannelError, ChannelFrame, ChannelLink, Connector, RemoteEnd, RoomEvent};
use crate::participant::{ParticipantId, ParticipantInfo};

/// Relay wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Join {
        document_id: String,
        participant: ParticipantInfo,
    },
    Leave,
    Message(Vec<u8>),
    Joined {
        participant_count: usize,
    },
    ParticipantJoined {
        participant: ParticipantInfo,
        participant_count: usize,
    },
    ParticipantLeft {
        participant: ParticipantId,
        participant_count: usize,
    },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ChannelError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        Ok(frame)
    }

    /// Relay-to-client frames as room events; `None` for client-bound ones.
    pub fn into_room_event(self) -> Option<RoomEvent> {
        match self {
            RelayFrame::Joined { participant_count } => Some(RoomEvent::Joined { participant_count }),
            RelayFrame::ParticipantJoined {
                participant,
                participant_count,
            } => Some(RoomEvent::ParticipantJoined {
                participant,
                participant_count,
            }),
            RelayFrame::ParticipantLeft {
                participant,
                participant_count,
            } => Some(RoomEvent::ParticipantLeft {
                participant,
                participant_count,
            }),
            RelayFrame::Message(bytes) => Some(RoomEvent::Message(bytes)),
            RelayFrame::Join { .. } | RelayFrame::Leave => None,
        }
    }
}

impl From<ChannelFrame> for RelayFrame {
    fn from(frame: ChannelFrame) -> Self {
        match frame {
            ChannelFrame::Join {
                document_id,
                participant,
            } => RelayFrame::Join {
                document_id,
                participant,
            },
            ChannelFrame::Leave => RelayFrame::Leave,
            ChannelFrame::Message(bytes) => RelayFrame::Message(bytes),
        }
    }
}

/// Connects to a relay over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
    capacity: usize,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            capacity: 256,
        }
    }

    /// Frames buffered per direction.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn room_url(&self, document_id: &str) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), document_id)
    }
}

impl Connector for WsConnector {
    fn connect(&self, document_id: &str) -> BoxFuture<'static, Result<ChannelLink, ChannelError>> {
        let url = self.room_url(document_id);
        let capacity = self.capacity;

        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
            log::debug!("Connected to relay at {url}");

            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let (link, remote) = ChannelLink::pair(capacity);
            let RemoteEnd { mut frames, events } = remote;

            // Writer task: forward session frames to the socket
            tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    let encoded = match RelayFrame::from(frame).encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Failed to encode relay frame: {e}");
                            continue;
                        }
                    };
                    if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: decode relay frames into room events
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                            Ok(frame) => match frame.into_room_event() {
                                Some(event) => {
                                    if events.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                None => log::debug!("Ignoring client-bound relay frame"),
                            },
                            Err(e) => log::warn!("Dropping undecodable relay frame: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                log::debug!("Relay connection closed");
            });

            Ok(link)
        }
        .boxed()
    }
}
