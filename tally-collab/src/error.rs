//! Error taxonomy for the synchronization engine.
//!
//! Only [`SessionError::ReplicaApply`] is fatal to a session. Everything else
//! is handled where it occurs: message-level failures are logged and dropped,
//! connection-level failures surface as a
//! [`ConnectionState`](crate::reconnect::ConnectionState) change.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::replica::ReplicaError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Truncated frame, unknown tag or undecodable sub-field.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A handshake step could not be processed; retried on the next attempt.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The reconnection loop gave up.
    #[error("Connection lost after {attempts} attempts")]
    ConnectionLost { attempts: u32 },

    /// A well-formed update could not be applied to the document replica.
    #[error("Replica failed to apply update: {0}")]
    ReplicaApply(#[from] ReplicaError),
}

impl SessionError {
    /// Whether this error must tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ReplicaApply(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
