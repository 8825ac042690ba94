//! Seam between a session and the relay transport.
//!
//! A [`Connector`] opens one [`ChannelLink`] per connection attempt. The link
//! is a pair of tokio channels: frames the session sends to the room and
//! events the room delivers back. When the transport dies the inbound side
//! closes, and that is the only loss signal a session needs.

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::participant::{ParticipantId, ParticipantInfo};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Relay protocol error: {0}")]
    Protocol(String),
}

/// Session → room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// Must be the first frame on a new link.
    Join {
        document_id: String,
        participant: ParticipantInfo,
    },
    Leave,
    /// Opaque encoded message, fanned out to every other member.
    Message(Vec<u8>),
}

/// Room → session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// Join acknowledged. `participant_count` includes ourselves.
    Joined { participant_count: usize },
    ParticipantJoined {
        participant: ParticipantInfo,
        participant_count: usize,
    },
    ParticipantLeft {
        participant: ParticipantId,
        participant_count: usize,
    },
    Message(Vec<u8>),
}

/// Session side of an open channel.
#[derive(Debug)]
pub struct ChannelLink {
    pub outbound: mpsc::Sender<ChannelFrame>,
    pub inbound: mpsc::Receiver<RoomEvent>,
}

/// Transport side of an open channel.
#[derive(Debug)]
pub struct RemoteEnd {
    pub frames: mpsc::Receiver<ChannelFrame>,
    pub events: mpsc::Sender<RoomEvent>,
}

impl ChannelLink {
    /// Create a connected link/remote pair, each direction buffering up to
    /// `capacity` items.
    pub fn pair(capacity: usize) -> (ChannelLink, RemoteEnd) {
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            ChannelLink {
                outbound: frame_tx,
                inbound: event_rx,
            },
            RemoteEnd {
                frames: frame_rx,
                events: event_tx,
            },
        )
    }

    /// Queue a frame without waiting. A full buffer is treated like a closed
    /// channel; the caller reconnects.
    pub fn try_send(&self, frame: ChannelFrame) -> Result<(), ChannelError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ChannelError::Protocol("outbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    /// Frames that can be queued right now without hitting a full buffer.
    pub fn spare_capacity(&self) -> usize {
        self.outbound.capacity()
    }
}

/// Opens channels to the room of a document.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, document_id: &str) -> BoxFuture<'static, Result<ChannelLink, ChannelError>>;
}

impl<C: Connector + ?Sized> Connector for std::sync::Arc<C> {
    fn connect(&self, document_id: &str) -> BoxFuture<'static, Result<ChannelLink, ChannelError>> {
        (**self).connect(document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_both_directions() {
        let (mut link, mut remote) = ChannelLink::pair(4);

        link.try_send(ChannelFrame::Message(vec![1, 2])).unwrap();
        assert_eq!(
            remote.frames.recv().await,
            Some(ChannelFrame::Message(vec![1, 2]))
        );

        remote
            .events
            .send(RoomEvent::Joined { participant_count: 1 })
            .await
            .unwrap();
        assert_eq!(
            link.inbound.recv().await,
            Some(RoomEvent::Joined { participant_count: 1 })
        );
    }

    #[tokio::test]
    async fn test_dropping_remote_closes_link() {
        let (mut link, remote) = ChannelLink::pair(4);
        drop(remote);
        assert!(link.inbound.recv().await.is_none());
        assert_eq!(link.try_send(ChannelFrame::Leave), Err(ChannelError::Closed));
    }

    #[test]
    fn test_full_buffer_is_error() {
        let (link, _remote) = ChannelLink::pair(1);
        link.try_send(ChannelFrame::Leave).unwrap();
        assert!(matches!(
            link.try_send(ChannelFrame::Leave),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_spare_capacity_tracks_queued_frames() {
        let (link, mut remote) = ChannelLink::pair(4);
        assert_eq!(link.spare_capacity(), 4);
        link.try_send(ChannelFrame::Leave).unwrap();
        assert_eq!(link.spare_capacity(), 3);
        remote.frames.recv().await.unwrap();
        assert_eq!(link.spare_capacity(), 4);
    }
}
