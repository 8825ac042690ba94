//! # tally-collab: Real-time document sync sessions
//!
//! Keeps a local replica of a shared document converged with every other
//! participant in the same room, and publishes who else is there.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  edits / presence   ┌──────────────┐
//! │ Application  │ ──────────────────► │ Session      │
//! └──────────────┘                     └──────┬───────┘
//!                                             │ Command
//!                                             ▼
//!                                      ┌──────────────┐
//!              ┌────────────────────── │ Connection   │ ──────────────────┐
//!              │                       │ (tokio task) │                   │
//!              ▼                       └──────┬───────┘                   ▼
//!      ┌───────────────┐                      │                  ┌────────────────┐
//!      │SyncCoordinator│                      │                  │PresenceRegistry│
//!      │ + replica     │                      ▼                  └────────────────┘
//!      └───────────────┘               ┌──────────────┐
//!                                      │ ChannelLink  │ ◄─── Connector (WebSocket)
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: Tagged lib0 framing for sync and presence messages
//! - [`replica`]: Document replica contract and the yrs-backed implementation
//! - [`presence`]: Clock-based presence store and registry
//! - [`sync`]: State-vector handshake and update relay
//! - [`reconnect`]: Connection state machine with exponential backoff
//! - [`channel`]: Transport seam (`Connector`, `ChannelLink`)
//! - [`ws`]: WebSocket connector
//! - [`session`]: Consumer-facing `Session`

pub mod channel;
pub mod codec;
pub mod config;
mod connection;
pub mod error;
pub mod participant;
pub mod presence;
pub mod reconnect;
pub mod replica;
pub mod session;
pub mod stats;
pub mod sync;
pub mod ws;

// Re-exports for convenience
pub use channel::{ChannelError, ChannelFrame, ChannelLink, Connector, RemoteEnd, RoomEvent};
pub use codec::{MessageKind, MessageReader, MessageWriter};
pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use participant::{ParticipantId, ParticipantInfo};
pub use presence::{
    AwarenessStore, PresenceChange, PresenceMetadata, PresenceRegistry, PresenceStore,
};
pub use reconnect::{CloseReason, ConnectionState, ReconnectPolicy, SyncStatus};
pub use replica::{
    DocumentReplica, MutationListeners, Origin, ReplicaError, Subscription, YrsReplica,
};
pub use session::{PresenceHandle, Session};
pub use stats::SessionStats;
pub use sync::{HandshakeState, SyncCoordinator, SyncMessage};
pub use ws::{RelayFrame, WsConnector};
