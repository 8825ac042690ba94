//! Ephemeral per-participant presence (name, color, cursor hints).
//!
//! ## Architecture
//!
//! ```text
//! set_local_state(meta)
//!       │
//!       ▼
//! PresenceRegistry ──► encode_delta([local]) ──► Presence message
//!       │
//!       ▼
//! AwarenessStore (clock per participant)
//!       ▲
//!       │
//! apply_delta(bytes) ◄── Presence message from a remote participant
//! ```
//!
//! Every entry carries a clock that its owner bumps on each change; a delta
//! entry only wins over a newer or equal clock. Entries that are not refreshed
//! within the liveness timeout are dropped by each participant on its own.
//! Who is present is therefore eventual and best-effort, not linearizable.
//!
//! Delta layout:
//! ```text
//! varUint(n) • n × ( varUint8Array(uuid) • varUint(clock) • varString(json) )
//! ```
//! where the JSON text `null` marks a participant that left.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::codec::{MessageReader, MessageWriter};
use crate::error::{Result, SessionError};
use crate::participant::ParticipantId;

/// Default liveness timeout (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque presence metadata published by a participant.
pub type PresenceMetadata = serde_json::Map<String, Value>;

/// Participants affected by one presence change. The three sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<ParticipantId>,
    pub updated: Vec<ParticipantId>,
    pub removed: Vec<ParticipantId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All affected ids, in added/updated/removed order.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    fn record(&mut self, id: ParticipantId, before: Option<&PresenceMetadata>, after: Option<&PresenceMetadata>) {
        match (before, after) {
            (None, Some(_)) => self.added.push(id),
            (Some(_), None) => self.removed.push(id),
            (Some(a), Some(b)) if a != b => self.updated.push(id),
            _ => {}
        }
    }
}

/// Result of merging a remote delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub change: PresenceChange,
    /// A peer claimed the local participant is gone; the local clock was
    /// bumped and the local state must be broadcast again.
    pub reannounce_local: bool,
}

/// Presence engine contract consumed by [`PresenceRegistry`].
pub trait PresenceStore: Send + 'static {
    fn local_id(&self) -> ParticipantId;

    /// Replace (or with `None`, withdraw) the local participant's metadata.
    fn set_local_state(&mut self, state: Option<PresenceMetadata>, now: Instant) -> PresenceChange;

    fn local_state(&self) -> Option<PresenceMetadata>;

    /// When the local entry was last written.
    fn local_last_updated(&self) -> Option<Instant>;

    /// Metadata of every participant currently considered present,
    /// including the local one.
    fn get_states(&self) -> HashMap<ParticipantId, PresenceMetadata>;

    /// Encode the listed participants only; unknown ids are skipped.
    fn encode_delta(&self, ids: &[ParticipantId]) -> Vec<u8>;

    /// Merge a delta. Either the whole delta is applied or, when it is
    /// corrupt, nothing is.
    fn apply_delta(&mut self, delta: &[u8], now: Instant) -> Result<DeltaOutcome>;

    /// Drop remote entries not refreshed within `timeout`.
    fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> PresenceChange;
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    clock: u64,
    /// `None` after an explicit leave; kept until the timeout purges it so a
    /// late, older delta cannot resurrect the participant.
    state: Option<PresenceMetadata>,
    last_updated: Instant,
}

#[derive(Debug)]
struct DeltaEntry {
    id: ParticipantId,
    clock: u64,
    state: Option<PresenceMetadata>,
}

/// Clock-based in-memory [`PresenceStore`].
#[derive(Debug)]
pub struct AwarenessStore {
    local_id: ParticipantId,
    entries: HashMap<ParticipantId, PresenceEntry>,
}

impl AwarenessStore {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            entries: HashMap::new(),
        }
    }

    /// Current clock of a participant, if known.
    pub fn clock(&self, id: &ParticipantId) -> Option<u64> {
        self.entries.get(id).map(|e| e.clock)
    }

    fn decode_delta(delta: &[u8]) -> Result<Vec<DeltaEntry>> {
        let mut reader = MessageReader::new(delta);
        let count = reader.read_var_u64()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let id_bytes = reader.read_bytes()?;
            let id = ParticipantId::from_slice(&id_bytes).map_err(|e| {
                SessionError::MalformedMessage(format!("invalid participant id: {e}"))
            })?;
            let clock = reader.read_var_u64()?;
            let json = reader.read_string()?;
            let state = match serde_json::from_str::<Value>(&json) {
                Ok(Value::Null) => None,
                Ok(Value::Object(map)) => Some(map),
                Ok(other) => {
                    return Err(SessionError::MalformedMessage(format!(
                        "presence state must be an object or null, got {other}"
                    )))
                }
                Err(e) => {
                    return Err(SessionError::MalformedMessage(format!(
                        "invalid presence json: {e}"
                    )))
                }
            };
            entries.push(DeltaEntry { id, clock, state });
        }
        reader.finish()?;
        Ok(entries)
    }
}

impl PresenceStore for AwarenessStore {
    fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    fn set_local_state(&mut self, state: Option<PresenceMetadata>, now: Instant) -> PresenceChange {
        let previous = self.entries.get(&self.local_id);
        let clock = previous.map_or(0, |e| e.clock + 1);
        let before = previous.and_then(|e| e.state.clone());

        let mut change = PresenceChange::default();
        change.record(self.local_id, before.as_ref(), state.as_ref());

        self.entries.insert(
            self.local_id,
            PresenceEntry {
                clock,
                state,
                last_updated: now,
            },
        );
        change
    }

    fn local_state(&self) -> Option<PresenceMetadata> {
        self.entries
            .get(&self.local_id)
            .and_then(|e| e.state.clone())
    }

    fn local_last_updated(&self) -> Option<Instant> {
        self.entries.get(&self.local_id).map(|e| e.last_updated)
    }

    fn get_states(&self) -> HashMap<ParticipantId, PresenceMetadata> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    fn encode_delta(&self, ids: &[ParticipantId]) -> Vec<u8> {
        let known: Vec<(&ParticipantId, &PresenceEntry)> = ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (id, e)))
            .collect();

        let mut writer = MessageWriter::new();
        writer.write_var_u64(known.len() as u64);
        for (id, entry) in known {
            let json = match &entry.state {
                Some(map) => Value::Object(map.clone()).to_string(),
                None => "null".to_string(),
            };
            writer
                .write_bytes(id.as_bytes())
                .write_var_u64(entry.clock)
                .write_string(&json);
        }
        writer.into_inner()
    }

    fn apply_delta(&mut self, delta: &[u8], now: Instant) -> Result<DeltaOutcome> {
        let decoded = Self::decode_delta(delta)?;
        let mut outcome = DeltaOutcome::default();

        for DeltaEntry { id, clock, state } in decoded {
            if id == self.local_id {
                // Remote input never writes local state. A removal of us at
                // an equal or newer clock gets outbid so our state spreads
                // again.
                if let Some(local) = self.entries.get_mut(&id) {
                    if state.is_none() && clock >= local.clock && local.state.is_some() {
                        local.clock = clock + 1;
                        local.last_updated = now;
                        outcome.reannounce_local = true;
                    }
                }
                continue;
            }

            let current = self.entries.get(&id);
            let accept = match current {
                None => true,
                Some(entry) => {
                    clock > entry.clock
                        || (clock == entry.clock && state.is_none() && entry.state.is_some())
                }
            };
            if !accept {
                log::trace!("Ignoring stale presence for {id} (clock {clock})");
                continue;
            }

            let before = current.and_then(|e| e.state.clone());
            outcome.change.record(id, before.as_ref(), state.as_ref());
            self.entries.insert(
                id,
                PresenceEntry {
                    clock,
                    state,
                    last_updated: now,
                },
            );
        }

        Ok(outcome)
    }

    fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> PresenceChange {
        let local_id = self.local_id;
        let outdated: Vec<ParticipantId> = self
            .entries
            .iter()
            .filter(|(id, e)| {
                **id != local_id && now.saturating_duration_since(e.last_updated) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();

        let mut change = PresenceChange::default();
        for id in outdated {
            if let Some(entry) = self.entries.remove(&id) {
                if entry.state.is_some() {
                    change.removed.push(id);
                }
            }
        }
        change
    }
}

/// Handle returned by [`PresenceRegistry::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback receiving each non-empty [`PresenceChange`].
pub type ChangeCallback = Box<dyn FnMut(&PresenceChange) + Send>;

/// Bridges a [`PresenceStore`] to the wire and to change listeners.
pub struct PresenceRegistry<S: PresenceStore = AwarenessStore> {
    store: S,
    timeout: Duration,
    listeners: Vec<(ListenerId, ChangeCallback)>,
    next_listener: u64,
}

impl PresenceRegistry<AwarenessStore> {
    /// Registry over a fresh [`AwarenessStore`].
    pub fn for_participant(local_id: ParticipantId, timeout: Duration) -> Self {
        Self::new(AwarenessStore::new(local_id), timeout)
    }
}

impl<S: PresenceStore> PresenceRegistry<S> {
    pub fn new(store: S, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.store.local_id()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn local_state(&self) -> Option<PresenceMetadata> {
        self.store.local_state()
    }

    /// Publish local metadata; returns the delta to broadcast.
    pub fn set_local_state(&mut self, metadata: PresenceMetadata, now: Instant) -> Vec<u8> {
        let change = self.store.set_local_state(Some(metadata), now);
        self.emit(&change);
        self.store.encode_delta(&[self.store.local_id()])
    }

    /// Withdraw local metadata (leave); returns the delta to broadcast.
    pub fn clear_local_state(&mut self, now: Instant) -> Vec<u8> {
        let change = self.store.set_local_state(None, now);
        self.emit(&change);
        self.store.encode_delta(&[self.store.local_id()])
    }

    /// Re-publish the current local state under a new clock, e.g. after
    /// joining a room. `None` when nothing has been published.
    pub fn announce_local(&mut self, now: Instant) -> Option<Vec<u8>> {
        let state = self.store.local_state()?;
        let change = self.store.set_local_state(Some(state), now);
        debug_assert!(change.is_empty());
        Some(self.store.encode_delta(&[self.store.local_id()]))
    }

    /// Keep-alive: re-announce local state once half the timeout has passed
    /// since it was last written.
    pub fn renew_local(&mut self, now: Instant) -> Option<Vec<u8>> {
        let last = self.store.local_last_updated()?;
        if now.saturating_duration_since(last) < self.timeout / 2 {
            return None;
        }
        self.announce_local(now)
    }

    pub fn on_change(&mut self, callback: ChangeCallback) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, callback));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn encode_delta(&self, ids: &[ParticipantId]) -> Vec<u8> {
        self.store.encode_delta(ids)
    }

    /// Merge a remote delta. A corrupt delta changes no entry and comes back
    /// as [`SessionError::MalformedMessage`]. On success, returns a delta to
    /// broadcast when the local state has to be re-announced.
    pub fn apply_delta(&mut self, delta: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        let outcome = self.store.apply_delta(delta, now)?;
        self.emit(&outcome.change);
        Ok(outcome
            .reannounce_local
            .then(|| self.store.encode_delta(&[self.store.local_id()])))
    }

    /// Remote participants currently present, excluding the local one.
    pub fn snapshot(&self) -> HashMap<ParticipantId, PresenceMetadata> {
        let local = self.store.local_id();
        let mut states = self.store.get_states();
        states.remove(&local);
        states
    }

    /// Apply the liveness timeout.
    pub fn expire(&mut self, now: Instant) -> PresenceChange {
        let change = self.store.remove_outdated(now, self.timeout);
        if !change.removed.is_empty() {
            log::debug!("Presence timed out for {} participant(s)", change.removed.len());
        }
        self.emit(&change);
        change
    }

    fn emit(&mut self, change: &PresenceChange) {
        if change.is_empty() {
            return;
        }
        for (_, callback) in self.listeners.iter_mut() {
            callback(change);
        }
    }
}
