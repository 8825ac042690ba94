//! Two-step state-vector handshake and steady-state update relay.
//!
//! ## Handshake
//!
//! ```text
//!   joiner                          member
//!     │ ── Step1(sv_joiner) ────────► │
//!     │ ◄── Step2(diff, sv_joiner) ── │   member answers every Step1
//!     │                               │
//!     │ ◄──── Step1(sv_member) ────── │   sent on participant_joined
//!     │ ── Step2(diff, sv_member) ──► │
//! ```
//!
//! A Step1 is always answered with a Step2 and never with another Step1, so
//! two participants cannot bounce handshakes off each other. The relay fans
//! every Step2 out to the whole room, so a Step2 echoes the state vector it
//! answers. The joiner applies every Step2 it sees but is synced only by one
//! answering a state vector it announced itself. A joiner that finds the room
//! empty is synced right away.
//!
//! Sync sub-payloads:
//! ```text
//! Step1  : varUint(0) • varUint8Array(state_vector)
//! Step2  : varUint(1) • varUint8Array(update) • varUint8Array(answered_state_vector)
//! Update : varUint(2) • varUint8Array(update)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec::{self, MessageKind, MessageReader, MessageWriter};
use crate::error::{Result, SessionError};
use crate::replica::{DocumentReplica, Origin, ReplicaError};
use crate::stats::AtomicSessionStats;

const STEP1: u32 = 0;
const STEP2: u32 = 1;
const UPDATE: u32 = 2;

/// Step1 state vectors remembered while a handshake is open.
const MAX_OPEN_REQUESTS: usize = 8;

/// Handshake progress for the current channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    AwaitingStep1Response,
    Synced,
}

/// Sync-kind message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's state vector.
    Step1(Vec<u8>),
    /// Everything the author of `answers` is missing.
    Step2 { update: Vec<u8>, answers: Vec<u8> },
    /// Incremental update after the handshake.
    Update(Vec<u8>),
}

impl SyncMessage {
    /// Encode as a complete `Sync` frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        match self {
            SyncMessage::Step1(sv) => writer.write_var_u32(STEP1).write_bytes(sv),
            SyncMessage::Step2 { update, answers } => writer
                .write_var_u32(STEP2)
                .write_bytes(update)
                .write_bytes(answers),
            SyncMessage::Update(update) => writer.write_var_u32(UPDATE).write_bytes(update),
        };
        codec::encode(MessageKind::Sync, &writer.into_inner())
    }

    /// Decode the payload of a `Sync` frame.
    pub fn decode(mut reader: MessageReader<'_>) -> Result<Self> {
        let message = match reader.read_var_u32()? {
            STEP1 => SyncMessage::Step1(reader.read_bytes()?),
            STEP2 => {
                let update = reader.read_bytes()?;
                let answers = reader.read_bytes()?;
                SyncMessage::Step2 { update, answers }
            }
            UPDATE => SyncMessage::Update(reader.read_bytes()?),
            other => {
                return Err(SessionError::MalformedMessage(format!(
                    "unknown sync step {other}"
                )))
            }
        };
        reader.finish()?;
        Ok(message)
    }
}

/// Local updates produced while not synced, replayed once the handshake
/// completes.
///
/// Bounded: once `max_size` updates are waiting the queue collapses into a
/// single full-state update taken from the replica at flush time.
#[derive(Debug)]
pub struct PendingUpdates {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
    overflowed: bool,
}

impl PendingUpdates {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            overflowed: false,
        }
    }

    /// Queue an update. Returns `false` if the queue collapsed instead.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.overflowed {
            return false;
        }
        if self.queue.len() >= self.max_size {
            log::warn!(
                "Pending update queue full ({} updates), falling back to full state",
                self.queue.len()
            );
            self.queue.clear();
            self.overflowed = true;
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Take everything queued, in production order, as at most `max_frames`
    /// updates. A queue longer than that comes out as one full-state update.
    pub fn drain<R: DocumentReplica + ?Sized>(
        &mut self,
        replica: &R,
        max_frames: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let overflowed = std::mem::take(&mut self.overflowed);
        if overflowed || self.queue.len() > max_frames {
            if !overflowed {
                log::debug!(
                    "{} queued updates exceed {} free frames, sending full state",
                    self.queue.len(),
                    max_frames
                );
            }
            self.queue.clear();
            return Ok(vec![replica.generate_update(&[])?]);
        }
        Ok(self.queue.drain(..).collect())
    }

    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.overflowed)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && !self.overflowed
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }

    pub fn is_collapsed(&self) -> bool {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.overflowed = false;
    }
}

/// Drives the handshake for one channel at a time and relays local updates.
///
/// Methods return encoded frames for the caller to send; the coordinator
/// performs no I/O. Updates queued before the handshake completed are taken
/// with [`SyncCoordinator::flush`].
pub struct SyncCoordinator<R: DocumentReplica + ?Sized> {
    replica: Arc<R>,
    state: HandshakeState,
    pending: PendingUpdates,
    /// State vectors of our unanswered Step1s.
    open_requests: Vec<Vec<u8>>,
    stats: Arc<AtomicSessionStats>,
}

impl<R: DocumentReplica + ?Sized> SyncCoordinator<R> {
    pub fn new(replica: Arc<R>, pending_capacity: usize, stats: Arc<AtomicSessionStats>) -> Self {
        Self {
            replica,
            state: HandshakeState::Idle,
            pending: PendingUpdates::new(pending_capacity),
            open_requests: Vec::new(),
            stats,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == HandshakeState::Synced
    }

    pub fn pending(&self) -> &PendingUpdates {
        &self.pending
    }

    /// Start the handshake after joining a room. With nobody else present
    /// there is no one to answer, so the replica counts as synced.
    pub fn begin(&mut self, peers_present: bool) -> Vec<Vec<u8>> {
        self.open_requests.clear();
        if !peers_present {
            log::debug!("Alone in room, handshake complete");
            self.complete();
            return Vec::new();
        }
        self.state = HandshakeState::AwaitingStep1Response;
        vec![self.announce()]
    }

    /// Step1 frame carrying our state vector. Sent to newcomers and as a
    /// handshake retry. While unsynced, a Step2 answering it completes the
    /// handshake.
    pub fn announce(&mut self) -> Vec<u8> {
        let sv = self.replica.state_vector();
        if self.state == HandshakeState::AwaitingStep1Response {
            if self.open_requests.len() == MAX_OPEN_REQUESTS {
                self.open_requests.remove(0);
            }
            self.open_requests.push(sv.clone());
        }
        SyncMessage::Step1(sv).encode()
    }

    /// The room emptied while we were waiting for a Step2.
    pub fn peers_gone(&mut self) {
        if self.state == HandshakeState::AwaitingStep1Response {
            log::debug!("All peers left during handshake, treating as synced");
            self.complete();
        }
    }

    /// Process one inbound `Sync` payload.
    pub fn handle(&mut self, reader: MessageReader<'_>) -> Result<Vec<Vec<u8>>> {
        match SyncMessage::decode(reader)? {
            SyncMessage::Step1(sv) => {
                let update = self.replica.generate_update(&sv).map_err(|e| match e {
                    ReplicaError::Decode(msg) => {
                        SessionError::HandshakeFailed(format!("bad state vector: {msg}"))
                    }
                    other => SessionError::ReplicaApply(other),
                })?;
                log::trace!("Answering step1 with {} byte diff", update.len());
                Ok(vec![SyncMessage::Step2 {
                    update,
                    answers: sv,
                }
                .encode()])
            }
            SyncMessage::Step2 { update, answers } => {
                self.replica
                    .apply_update(&update, Origin::Remote)
                    .map_err(|e| match e {
                        ReplicaError::Decode(msg) => {
                            SessionError::HandshakeFailed(format!("bad step2 diff: {msg}"))
                        }
                        other => SessionError::ReplicaApply(other),
                    })?;
                if self.state == HandshakeState::AwaitingStep1Response {
                    if self.open_requests.contains(&answers) {
                        self.complete();
                    } else {
                        log::trace!("Step2 answered another participant, still awaiting ours");
                    }
                }
                Ok(Vec::new())
            }
            SyncMessage::Update(update) => {
                self.replica
                    .apply_update(&update, Origin::Remote)
                    .map_err(|e| match e {
                        ReplicaError::Decode(msg) => {
                            SessionError::MalformedMessage(format!("bad update: {msg}"))
                        }
                        other => SessionError::ReplicaApply(other),
                    })?;
                Ok(Vec::new())
            }
        }
    }

    /// Route a mutation notification from the replica. Remote-origin updates
    /// are never sent back out.
    pub fn on_local_update(&mut self, update: &[u8], origin: Origin) -> Option<Vec<u8>> {
        if origin == Origin::Remote {
            self.stats.record_echo_suppressed();
            return None;
        }
        if self.is_synced() {
            return Some(SyncMessage::Update(update.to_vec()).encode());
        }
        self.pending.enqueue(update.to_vec());
        None
    }

    /// Queued updates as `Update` frames, at most `max_frames` of them.
    /// Empty until the handshake has completed.
    pub fn flush(&mut self, max_frames: usize) -> Result<Vec<Vec<u8>>> {
        if !self.is_synced() || self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let queued = self.pending.drain(self.replica.as_ref(), max_frames)?;
        log::info!("Flushing {} queued updates", queued.len());
        Ok(queued
            .into_iter()
            .map(|update| SyncMessage::Update(update).encode())
            .collect())
    }

    /// Channel lost: the next channel needs a fresh handshake. Queued
    /// updates are kept.
    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
        self.open_requests.clear();
    }

    fn complete(&mut self) {
        self.state = HandshakeState::Synced;
        self.open_requests.clear();
    }
}
