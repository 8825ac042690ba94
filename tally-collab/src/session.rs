//! Consumer-facing handle over one document session.
//!
//! ```rust,ignore
//! let session = Session::open(WsConnector::new("ws://localhost:9090"), "doc-42", ParticipantInfo::new("Ana"));
//! session.connect();
//! session.presence().set_local_state(meta);
//! let text = session.document().doc().get_or_insert_text("body");
//! session.document().edit(|txn| text.insert(txn, 0, "hello"));
//! session.close().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::channel::Connector;
use crate::config::SessionConfig;
use crate::connection::{self, Command, SessionShared};
use crate::participant::{ParticipantId, ParticipantInfo};
use crate::presence::{PresenceChange, PresenceMetadata};
use crate::reconnect::ConnectionState;
use crate::replica::{DocumentReplica, YrsReplica};
use crate::stats::SessionStats;

/// A participant's view of one replicated document.
///
/// Created disconnected; call [`Session::connect`]. Dropping the session
/// closes it.
pub struct Session<R: DocumentReplica = YrsReplica> {
    document_id: String,
    participant: ParticipantInfo,
    replica: Arc<R>,
    presence: PresenceHandle,
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Session<YrsReplica> {
    /// Open a session over a fresh [`YrsReplica`] with default settings.
    /// Must be called within a tokio runtime.
    pub fn open(
        connector: impl Connector,
        document_id: impl Into<String>,
        participant: ParticipantInfo,
    ) -> Self {
        Self::open_with(
            connector,
            Arc::new(YrsReplica::new()),
            document_id,
            participant,
            SessionConfig::default(),
        )
    }
}

impl<R: DocumentReplica> Session<R> {
    /// Open a session over a caller-provided replica.
    /// Must be called within a tokio runtime.
    pub fn open_with(
        connector: impl Connector,
        replica: Arc<R>,
        document_id: impl Into<String>,
        participant: ParticipantInfo,
        config: SessionConfig,
    ) -> Self {
        let document_id = document_id.into();
        let (shared, commands) = connection::spawn(
            Arc::new(connector),
            replica.clone(),
            document_id.clone(),
            participant.clone(),
            config,
        );
        let presence = PresenceHandle {
            local_id: participant.participant_id,
            shared: shared.clone(),
            commands: commands.clone(),
        };
        Self {
            document_id,
            participant,
            replica,
            presence,
            shared,
            commands,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn participant(&self) -> &ParticipantInfo {
        &self.participant
    }

    /// The replicated document. Local edits made on it are synchronized.
    pub fn document(&self) -> &Arc<R> {
        &self.replica
    }

    pub fn presence(&self) -> &PresenceHandle {
        &self.presence
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Room size (including us) as last reported by the relay; 0 when not
    /// joined.
    pub fn participant_count(&self) -> usize {
        self.shared.participant_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    /// Start connecting. A no-op while connecting or joined; after
    /// [`ConnectionState::ConnectionLost`] it starts a fresh series of
    /// attempts.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Leave the room and stop the session. Idempotent.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close(Some(done_tx))).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl<R: DocumentReplica> Drop for Session<R> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close(None));
    }
}

/// Presence operations of a [`Session`].
#[derive(Clone)]
pub struct PresenceHandle {
    local_id: ParticipantId,
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PresenceHandle {
    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    /// Publish local metadata. Sent now if joined, otherwise on join.
    pub fn set_local_state(&self, metadata: PresenceMetadata) {
        let _ = self.commands.send(Command::SetPresence(metadata));
    }

    /// Withdraw local metadata; peers see us as removed.
    pub fn clear_local_state(&self) {
        let _ = self.commands.send(Command::ClearPresence);
    }

    /// Remote participants currently present. Excludes the local participant.
    pub fn snapshot(&self) -> HashMap<ParticipantId, PresenceMetadata> {
        self.shared.presence_snapshot()
    }

    /// Stream of presence changes, local ones included.
    pub fn changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.shared.presence_events.subscribe()
    }
}

impl std::fmt::Debug for PresenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceHandle")
            .field("local_id", &self.local_id)
            .finish()
    }
}
