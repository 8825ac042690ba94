//! Shared fixtures: an in-memory relay, a minimal replica and wait helpers.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tally_collab::channel::{
    ChannelError, ChannelFrame, ChannelLink, Connector, RemoteEnd, RoomEvent,
};
use tally_collab::codec::{self, MessageKind, MessageReader, MessageWriter};
use tally_collab::participant::{ParticipantId, ParticipantInfo};
use tally_collab::presence::PresenceMetadata;
use tally_collab::replica::{
    DocumentReplica, MutationCallback, MutationListeners, Origin, ReplicaError, Subscription,
};
use tally_collab::session::Session;
use tally_collab::sync::SyncMessage;
use tokio::sync::mpsc;
use yrs::{GetString, Text, Transact};

// ─── In-memory relay ─────────────────────────────────────────────

struct Member {
    conn: u64,
    participant: ParticipantInfo,
    /// The only sender of the member's inbound channel; removing the member
    /// closes that channel.
    events: mpsc::Sender<RoomEvent>,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, Vec<Member>>,
    next_conn: u64,
    fail_next: u32,
    connects: u32,
    /// Every Message frame, with its sender, in relay order.
    log: Vec<(ParticipantId, Vec<u8>)>,
}

/// Fan-out relay: every Message frame goes to all other joined members.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().unwrap().fail_next = n;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    /// Drop every member of a room, as if the relay restarted.
    pub fn sever_room(&self, document_id: &str) {
        self.state.lock().unwrap().rooms.remove(document_id);
    }

    /// Drop one participant's channel; the others see it leave.
    pub fn sever(&self, document_id: &str, participant: ParticipantId) {
        let mut state = self.state.lock().unwrap();
        if let Some(members) = state.rooms.get_mut(document_id) {
            members.retain(|m| m.participant.participant_id != participant);
            let count = members.len();
            for m in members.iter() {
                let _ = m.events.try_send(RoomEvent::ParticipantLeft {
                    participant,
                    participant_count: count,
                });
            }
        }
    }

    pub fn member_count(&self, document_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .rooms
            .get(document_id)
            .map_or(0, Vec::len)
    }

    /// Message frames sent by one participant.
    pub fn sent_by(&self, participant: ParticipantId) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(from, _)| *from == participant)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Sync messages sent by one participant, decoded.
    pub fn sync_sent_by(&self, participant: ParticipantId) -> Vec<SyncMessage> {
        self.sent_by(participant)
            .iter()
            .filter_map(|bytes| {
                let (kind, reader) = codec::decode(bytes).ok()?;
                (kind == MessageKind::Sync).then(|| SyncMessage::decode(reader).ok())?
            })
            .collect()
    }

    fn open(&self, document_id: String) -> Result<ChannelLink, ChannelError> {
        let conn = {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(ChannelError::ConnectFailed("relay unavailable".into()));
            }
            state.next_conn += 1;
            state.next_conn
        };

        let (link, remote) = ChannelLink::pair(256);
        let RemoteEnd { mut frames, events } = remote;
        let mut events = Some(events);
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match frame {
                    ChannelFrame::Join { participant, .. } => {
                        if let Some(events) = events.take() {
                            relay.join(&document_id, conn, participant, events);
                        }
                    }
                    ChannelFrame::Message(bytes) => relay.fan_out(&document_id, conn, bytes),
                    ChannelFrame::Leave => break,
                }
            }
            relay.leave(&document_id, conn);
        });
        Ok(link)
    }

    fn join(
        &self,
        document_id: &str,
        conn: u64,
        participant: ParticipantInfo,
        events: mpsc::Sender<RoomEvent>,
    ) {
        let mut state = self.state.lock().unwrap();
        let members = state.rooms.entry(document_id.to_string()).or_default();
        let count = members.len() + 1;
        let _ = events.try_send(RoomEvent::Joined {
            participant_count: count,
        });
        for m in members.iter() {
            let _ = m.events.try_send(RoomEvent::ParticipantJoined {
                participant: participant.clone(),
                participant_count: count,
            });
        }
        members.push(Member {
            conn,
            participant,
            events,
        });
    }

    fn fan_out(&self, document_id: &str, conn: u64, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        let Some(members) = state.rooms.get(document_id) else {
            return;
        };
        let Some(sender) = members
            .iter()
            .find(|m| m.conn == conn)
            .map(|m| m.participant.participant_id)
        else {
            return;
        };
        for m in members.iter().filter(|m| m.conn != conn) {
            let _ = m.events.try_send(RoomEvent::Message(bytes.clone()));
        }
        state.log.push((sender, bytes));
    }

    fn leave(&self, document_id: &str, conn: u64) {
        let mut state = self.state.lock().unwrap();
        let Some(members) = state.rooms.get_mut(document_id) else {
            return;
        };
        let Some(pos) = members.iter().position(|m| m.conn == conn) else {
            return;
        };
        let gone = members.remove(pos);
        let count = members.len();
        for m in members.iter() {
            let _ = m.events.try_send(RoomEvent::ParticipantLeft {
                participant: gone.participant.participant_id,
                participant_count: count,
            });
        }
    }
}

impl Connector for MemoryRelay {
    fn connect(&self, document_id: &str) -> BoxFuture<'static, Result<ChannelLink, ChannelError>> {
        future::ready(self.open(document_id.to_string())).boxed()
    }
}

/// Room that accepts a single channel, reports the caller alone in it and
/// never reads what is sent. Later connects fail.
#[derive(Default)]
pub struct StalledRoom {
    capacity: usize,
    remotes: Mutex<Vec<RemoteEnd>>,
}

impl StalledRoom {
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            remotes: Mutex::new(Vec::new()),
        })
    }
}

impl Connector for StalledRoom {
    fn connect(&self, _document_id: &str) -> BoxFuture<'static, Result<ChannelLink, ChannelError>> {
        let mut remotes = self.remotes.lock().unwrap();
        if !remotes.is_empty() {
            return future::ready(Err(ChannelError::ConnectFailed("room closed".into()))).boxed();
        }
        let (link, remote) = ChannelLink::pair(self.capacity);
        let _ = remote
            .events
            .try_send(RoomEvent::Joined { participant_count: 1 });
        remotes.push(remote);
        future::ready(Ok(link)).boxed()
    }
}

// ─── Log replica ─────────────────────────────────────────────────

/// Grow-only set of opaque operations keyed by `(client, seq)`.
///
/// Update: `varUint(n) • n × (varUint(client) • varUint(seq) • varUint8Array(op))`.
/// State vector: `varUint(n) • n × (varUint(client) • varUint(seq))`.
pub struct LogReplica {
    client: u64,
    ops: Mutex<HashMap<(u64, u64), Vec<u8>>>,
    listeners: Arc<MutationListeners>,
    fail_applies: AtomicBool,
}

impl LogReplica {
    pub fn new(client: u64) -> Self {
        Self {
            client,
            ops: Mutex::new(HashMap::new()),
            listeners: MutationListeners::new(),
            fail_applies: AtomicBool::new(false),
        }
    }

    /// Record a local operation.
    pub fn append(&self, op: &[u8]) {
        let update = {
            let mut ops = self.ops.lock().unwrap();
            let seq = ops.keys().filter(|(c, _)| *c == self.client).count() as u64;
            ops.insert((self.client, seq), op.to_vec());
            encode_ops([((self.client, seq), op)].into_iter())
        };
        self.listeners.notify(&update, Origin::Local);
    }

    /// Sorted operation keys; equal sets mean converged replicas.
    pub fn keys(&self) -> BTreeSet<(u64, u64)> {
        self.ops.lock().unwrap().keys().copied().collect()
    }

    /// Reject every well-formed update from now on.
    pub fn fail_applies(&self) {
        self.fail_applies.store(true, Ordering::SeqCst);
    }
}

fn encode_ops<'a>(ops: impl ExactSizeIterator<Item = ((u64, u64), &'a [u8])>) -> Vec<u8> {
    let mut writer = MessageWriter::new();
    writer.write_var_u64(ops.len() as u64);
    for ((client, seq), op) in ops {
        writer.write_var_u64(client).write_var_u64(seq).write_bytes(op);
    }
    writer.into_inner()
}

fn decode_err(e: impl std::fmt::Display) -> ReplicaError {
    ReplicaError::Decode(e.to_string())
}

impl DocumentReplica for LogReplica {
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), ReplicaError> {
        let mut reader = MessageReader::new(update);
        let count = reader.read_var_u64().map_err(decode_err)?;
        let mut incoming = Vec::new();
        for _ in 0..count {
            let client = reader.read_var_u64().map_err(decode_err)?;
            let seq = reader.read_var_u64().map_err(decode_err)?;
            let op = reader.read_bytes().map_err(decode_err)?;
            incoming.push(((client, seq), op));
        }
        reader.finish().map_err(decode_err)?;

        if self.fail_applies.load(Ordering::SeqCst) {
            return Err(ReplicaError::Apply("log replica rejected update".into()));
        }

        let fresh = {
            let mut ops = self.ops.lock().unwrap();
            let mut fresh = Vec::new();
            for (key, op) in incoming {
                if !ops.contains_key(&key) {
                    ops.insert(key, op.clone());
                    fresh.push((key, op));
                }
            }
            fresh
        };
        if !fresh.is_empty() {
            let update = encode_ops(fresh.iter().map(|(k, op)| (*k, op.as_slice())));
            self.listeners.notify(&update, origin);
        }
        Ok(())
    }

    fn generate_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let mut known = BTreeSet::new();
        if !state_vector.is_empty() {
            let mut reader = MessageReader::new(state_vector);
            let count = reader.read_var_u64().map_err(decode_err)?;
            for _ in 0..count {
                let client = reader.read_var_u64().map_err(decode_err)?;
                let seq = reader.read_var_u64().map_err(decode_err)?;
                known.insert((client, seq));
            }
            reader.finish().map_err(decode_err)?;
        }
        let ops = self.ops.lock().unwrap();
        let missing: Vec<_> = ops
            .iter()
            .filter(|(key, _)| !known.contains(*key))
            .map(|(key, op)| (*key, op.as_slice()))
            .collect();
        Ok(encode_ops(missing.into_iter()))
    }

    fn state_vector(&self) -> Vec<u8> {
        let keys = self.keys();
        let mut writer = MessageWriter::new();
        writer.write_var_u64(keys.len() as u64);
        for (client, seq) in keys {
            writer.write_var_u64(client).write_var_u64(seq);
        }
        writer.into_inner()
    }

    fn on_mutation(&self, callback: MutationCallback) -> Subscription {
        self.listeners.subscribe(callback)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

/// Poll `condition` every 10ms (virtual time under a paused clock) until it
/// holds, panicking after `limit`.
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while !condition() {
        if waited >= limit {
            panic!("condition not met within {limit:?}");
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
}

pub async fn wait_until(condition: impl FnMut() -> bool) {
    wait_for(Duration::from_secs(10), condition).await;
}

pub fn metadata(value: Value) -> PresenceMetadata {
    match value {
        Value::Object(map) => map,
        other => panic!("presence metadata must be an object, got {other}"),
    }
}

pub fn ana() -> PresenceMetadata {
    metadata(json!({"name": "Ana", "color": "#F87171"}))
}

pub fn type_text(session: &Session, index: u32, chunk: &str) {
    let text = session.document().doc().get_or_insert_text("body");
    session.document().edit(|txn| text.insert(txn, index, chunk));
}

pub fn text(session: &Session) -> String {
    let doc = session.document().doc();
    let body = doc.get_or_insert_text("body");
    let txn = doc.transact();
    body.get_string(&txn)
}

/// Open a session, connect it and wait until it is synced.
pub async fn open_synced(relay: &MemoryRelay, document_id: &str, name: &str) -> Session {
    let session = Session::open(relay.clone(), document_id, ParticipantInfo::new(name));
    session.connect();
    wait_until(|| session.connection_state().is_synced()).await;
    session
}

/// Join a room with a bare channel, bypassing the session machinery.
pub async fn raw_member(
    relay: &MemoryRelay,
    document_id: &str,
    participant: ParticipantInfo,
) -> ChannelLink {
    let mut link = relay.connect(document_id).await.unwrap();
    link.outbound
        .send(ChannelFrame::Join {
            document_id: document_id.to_string(),
            participant,
        })
        .await
        .unwrap();
    match link.inbound.recv().await {
        Some(RoomEvent::Joined { .. }) => link,
        other => panic!("expected join ack, got {other:?}"),
    }
}
