//! Per-session driver task.
//!
//! ## Architecture
//!
//! ```text
//!   Session ──Command──┐
//!                      │
//!   replica ─mutation──┼──► select! loop ──► SyncCoordinator ──┐
//!                      │        │                              │
//!   ChannelLink ─event─┘        ├──► PresenceRegistry ─────────┼──► ChannelLink
//!                               │                              │
//!   timers (retry, handshake,   └──► Reconnector ──► LinkAction┘
//!           presence tick)
//! ```
//!
//! Everything that touches sync, presence or connection state runs on this
//! one task, so inbound frames, local mutations and presence commands are
//! handled strictly one at a time. The facade reads results through
//! [`SessionShared`].

use std::collections::HashMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant as StdInstant;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, Sleep};

use crate::channel::{ChannelError, ChannelFrame, ChannelLink, Connector, RoomEvent};
use crate::codec::{self, MessageKind};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::participant::{ParticipantId, ParticipantInfo};
use crate::presence::{PresenceChange, PresenceMetadata, PresenceRegistry};
use crate::reconnect::{ConnectionState, LinkAction, LinkEvent, Reconnector};
use crate::replica::{DocumentReplica, Origin, Subscription};
use crate::stats::AtomicSessionStats;
use crate::sync::{HandshakeState, SyncCoordinator};

/// Requests from the facade.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    SetPresence(PresenceMetadata),
    ClearPresence,
    Close(Option<oneshot::Sender<()>>),
}

/// State the driver publishes for the facade.
pub(crate) struct SessionShared {
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) participant_count: AtomicUsize,
    pub(crate) presence: RwLock<HashMap<ParticipantId, PresenceMetadata>>,
    pub(crate) presence_events: broadcast::Sender<PresenceChange>,
    pub(crate) stats: Arc<AtomicSessionStats>,
}

impl SessionShared {
    fn new(presence_event_capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (presence_events, _) = broadcast::channel(presence_event_capacity);
        Self {
            state,
            participant_count: AtomicUsize::new(0),
            presence: RwLock::new(HashMap::new()),
            presence_events,
            stats: Arc::new(AtomicSessionStats::new()),
        }
    }

    pub(crate) fn presence_snapshot(&self) -> HashMap<ParticipantId, PresenceMetadata> {
        self.presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

type ConnectFuture = BoxFuture<'static, Result<ChannelLink, ChannelError>>;
type Mutation = (Vec<u8>, Origin);

/// Start the driver for one session. Must be called within a tokio runtime.
pub(crate) fn spawn<R: DocumentReplica>(
    connector: Arc<dyn Connector>,
    replica: Arc<R>,
    document_id: String,
    participant: ParticipantInfo,
    config: SessionConfig,
) -> (Arc<SessionShared>, mpsc::UnboundedSender<Command>) {
    let shared = Arc::new(SessionShared::new(config.presence_event_capacity));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (mutation_tx, mutation_rx) = mpsc::unbounded_channel::<Mutation>();

    let subscription = replica.on_mutation(Box::new(move |update, origin| {
        let _ = mutation_tx.send((update.to_vec(), origin));
    }));

    let changes = Arc::new(Mutex::new(Vec::new()));
    let mut presence = PresenceRegistry::for_participant(
        participant.participant_id,
        config.presence_timeout,
    );
    let sink = changes.clone();
    presence.on_change(Box::new(move |change| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change.clone());
    }));

    let driver = Connection {
        sync: SyncCoordinator::new(replica, config.pending_capacity, shared.stats.clone()),
        reconnector: Reconnector::new(config.reconnect),
        presence,
        presence_changes: changes,
        document_id,
        participant,
        connector,
        config,
        link: None,
        connecting: None,
        retry: None,
        handshake_deadline: None,
        subscription: Some(subscription),
        shared: shared.clone(),
    };
    tokio::spawn(driver.run(command_rx, mutation_rx));

    (shared, command_tx)
}

struct Connection<R: DocumentReplica> {
    document_id: String,
    participant: ParticipantInfo,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    reconnector: Reconnector,
    sync: SyncCoordinator<R>,
    presence: PresenceRegistry,
    /// Filled by the registry's change listener, drained after each step.
    presence_changes: Arc<Mutex<Vec<PresenceChange>>>,
    link: Option<ChannelLink>,
    connecting: Option<ConnectFuture>,
    retry: Option<Pin<Box<Sleep>>>,
    handshake_deadline: Option<Pin<Box<Sleep>>>,
    subscription: Option<Subscription>,
    shared: Arc<SessionShared>,
}

impl<R: DocumentReplica> Connection<R> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut mutations: mpsc::UnboundedReceiver<Mutation>,
    ) {
        let mut tick = tokio::time::interval(self.config.presence_check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut close_waiters = Vec::new();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(done)) => {
                        close_waiters.extend(done);
                        self.apply(LinkEvent::Close);
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        log::debug!("Session for {} dropped", self.document_id);
                        self.apply(LinkEvent::Close);
                    }
                },
                Some((update, origin)) = mutations.recv() => self.on_mutation(&update, origin),
                event = recv_link(&mut self.link) => self.on_room_event(event),
                result = connect_result(&mut self.connecting) => self.on_connect_result(result),
                _ = elapsed(&mut self.retry) => {
                    self.retry = None;
                    self.shared.stats.record_reconnect();
                    self.apply(LinkEvent::RetryElapsed);
                }
                _ = elapsed(&mut self.handshake_deadline) => self.on_handshake_timeout(),
                _ = tick.tick() => self.on_tick(),
            }

            self.flush_presence();
            if self.reconnector.state().is_closed() {
                break;
            }
        }

        log::info!("Session for {} closed", self.document_id);
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
    }

    fn apply(&mut self, event: LinkEvent) {
        let action = self.reconnector.handle(event);
        self.perform(action);
        self.publish_state();
    }

    fn perform(&mut self, action: LinkAction) {
        match action {
            LinkAction::OpenChannel => {
                log::debug!("Opening channel to {}", self.document_id);
                self.connecting = Some(self.connector.connect(&self.document_id));
            }
            LinkAction::SendJoin => {
                let join = ChannelFrame::Join {
                    document_id: self.document_id.clone(),
                    participant: self.participant.clone(),
                };
                self.send(join);
            }
            LinkAction::BeginHandshake { peers_present } => self.begin_handshake(peers_present),
            LinkAction::ScheduleRetry(delay) => {
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            LinkAction::GiveUp => {
                log::warn!(
                    "{}",
                    SessionError::ConnectionLost {
                        attempts: self.reconnector.attempts()
                    }
                );
            }
            LinkAction::Teardown => self.teardown(),
            LinkAction::Nothing => {}
        }
    }

    fn publish_state(&self) {
        let next = self.reconnector.state();
        self.shared.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::info!("{}: {:?} -> {:?}", self.document_id, current, next);
            *current = next;
            true
        });
    }

    fn set_participant_count(&self, count: usize) {
        self.shared.participant_count.store(count, Ordering::Relaxed);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.apply(LinkEvent::Connect),
            Command::SetPresence(metadata) => {
                let delta = self.presence.set_local_state(metadata, now());
                self.send_presence(delta);
            }
            Command::ClearPresence => {
                let delta = self.presence.clear_local_state(now());
                self.send_presence(delta);
            }
            Command::Close(_) => self.apply(LinkEvent::Close),
        }
    }

    fn on_connect_result(&mut self, result: Result<ChannelLink, ChannelError>) {
        self.connecting = None;
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.apply(LinkEvent::ChannelOpened);
            }
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.document_id);
                self.apply(LinkEvent::ConnectFailed);
            }
        }
    }

    fn on_room_event(&mut self, event: Option<RoomEvent>) {
        match event {
            None => {
                log::info!("Channel to {} lost", self.document_id);
                self.on_link_lost();
            }
            Some(RoomEvent::Joined { participant_count }) => {
                log::info!(
                    "Joined {} with {} participant(s)",
                    self.document_id,
                    participant_count
                );
                self.set_participant_count(participant_count);
                self.apply(LinkEvent::Joined { participant_count });
            }
            Some(RoomEvent::ParticipantJoined {
                participant,
                participant_count,
            }) => {
                log::debug!("{} ({}) joined", participant.name, participant.participant_id);
                self.set_participant_count(participant_count);
                if self.reconnector.state().is_joined() {
                    let step1 = self.sync.announce();
                    self.send_message(step1);
                    if self.presence.local_state().is_some() {
                        let delta = self.presence.encode_delta(&[self.presence.local_id()]);
                        self.send_presence(delta);
                    }
                }
            }
            Some(RoomEvent::ParticipantLeft {
                participant,
                participant_count,
            }) => {
                log::debug!("{participant} left");
                self.set_participant_count(participant_count);
                if participant_count <= 1 && self.reconnector.state().is_joined() {
                    self.sync.peers_gone();
                    self.after_sync_step();
                }
            }
            Some(RoomEvent::Message(bytes)) => self.on_message(&bytes),
        }
    }

    fn on_message(&mut self, bytes: &[u8]) {
        let (kind, reader) = match codec::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping message: {e}");
                self.shared.stats.record_malformed();
                return;
            }
        };
        self.shared.stats.record_received();

        match kind {
            MessageKind::Sync => {
                match self.sync.handle(reader) {
                    Ok(frames) => self.send_all(frames),
                    Err(e) => self.on_sync_error(e),
                }
                self.after_sync_step();
            }
            MessageKind::Presence => match self.presence.apply_delta(reader.remaining(), now()) {
                Ok(Some(reannounce)) => self.send_presence(reannounce),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Dropping presence delta: {e}");
                    self.shared.stats.record_malformed();
                }
            },
        }
    }

    fn on_mutation(&mut self, update: &[u8], origin: Origin) {
        if let Some(frame) = self.sync.on_local_update(update, origin) {
            self.send_update(frame);
        }
    }

    fn on_sync_error(&mut self, error: SessionError) {
        if error.is_fatal() {
            log::error!("Closing session for {}: {error}", self.document_id);
            self.apply(LinkEvent::ReplicaFault);
            return;
        }
        if matches!(error, SessionError::MalformedMessage(_)) {
            self.shared.stats.record_malformed();
        }
        log::warn!("Dropping sync message: {error}");
    }

    fn begin_handshake(&mut self, peers_present: bool) {
        let frames = self.sync.begin(peers_present);
        self.send_all(frames);
        if let Some(delta) = self.presence.announce_local(now()) {
            self.send_presence(delta);
        }
        self.after_sync_step();
    }

    /// Keep the visible state and the handshake timer in line with the
    /// coordinator.
    fn after_sync_step(&mut self) {
        if self.reconnector.state().is_closed() || self.link.is_none() {
            return;
        }
        match self.sync.state() {
            HandshakeState::Synced => {
                self.handshake_deadline = None;
                if !self.reconnector.state().is_synced() {
                    if !self.flush_pending() {
                        return;
                    }
                    log::info!("Synced with {}", self.document_id);
                    self.apply(LinkEvent::HandshakeComplete);
                }
            }
            HandshakeState::AwaitingStep1Response if self.handshake_deadline.is_none() => {
                self.handshake_deadline =
                    Some(Box::pin(tokio::time::sleep(self.config.handshake_timeout)));
            }
            _ => {}
        }
    }

    fn on_handshake_timeout(&mut self) {
        self.handshake_deadline = None;
        if self.link.is_none() || self.sync.state() != HandshakeState::AwaitingStep1Response {
            return;
        }
        log::warn!(
            "{}; resending step1",
            SessionError::HandshakeFailed(format!(
                "no step2 within {:?}",
                self.config.handshake_timeout
            ))
        );
        let step1 = self.sync.announce();
        self.send_message(step1);
        self.after_sync_step();
    }

    fn on_tick(&mut self) {
        let at = now();
        self.presence.expire(at);
        if self.reconnector.state().is_joined() {
            if let Some(delta) = self.presence.renew_local(at) {
                self.send_presence(delta);
            }
        }
    }

    fn on_link_lost(&mut self) {
        self.link = None;
        self.handshake_deadline = None;
        self.sync.reset();
        self.set_participant_count(0);
        self.apply(LinkEvent::ChannelLost);
    }

    fn send_presence(&mut self, delta: Vec<u8>) {
        if self.reconnector.state().is_joined() {
            self.send_message(codec::encode(MessageKind::Presence, &delta));
        }
    }

    /// Send updates queued while unsynced within half the link's free slots;
    /// the other half stays free for presence and live edits. Returns `false`
    /// if the link or the session went away.
    fn flush_pending(&mut self) -> bool {
        let budget = self
            .link
            .as_ref()
            .map_or(0, |link| link.spare_capacity() / 2);
        match self.sync.flush(budget) {
            Ok(frames) => {
                for frame in frames {
                    if !self.send_update(frame) {
                        return false;
                    }
                }
                true
            }
            Err(e) => {
                self.on_sync_error(e);
                self.link.is_some() && !self.reconnector.state().is_closed()
            }
        }
    }

    fn send_update(&mut self, frame: Vec<u8>) -> bool {
        let sent = self.send_message(frame);
        if sent {
            self.shared.stats.record_update_sent();
        }
        sent
    }

    fn send_all(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            if !self.send_message(frame) {
                break;
            }
        }
    }

    fn send_message(&mut self, frame: Vec<u8>) -> bool {
        self.send(ChannelFrame::Message(frame))
    }

    /// Queue a frame on the current link. A failed send is handled as a
    /// lost channel.
    fn send(&mut self, frame: ChannelFrame) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        let is_message = matches!(frame, ChannelFrame::Message(_));
        match link.try_send(frame) {
            Ok(()) => {
                if is_message {
                    self.shared.stats.record_sent();
                }
                true
            }
            Err(e) => {
                log::warn!("Send to {} failed: {e}", self.document_id);
                self.on_link_lost();
                false
            }
        }
    }

    /// Best-effort goodbye, then drop every resource.
    fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            if self.presence.local_state().is_some() {
                let delta = self.presence.clear_local_state(now());
                let _ = link.try_send(ChannelFrame::Message(codec::encode(
                    MessageKind::Presence,
                    &delta,
                )));
            }
            let _ = link.try_send(ChannelFrame::Leave);
        }
        self.connecting = None;
        self.retry = None;
        self.handshake_deadline = None;
        self.subscription = None;
        self.presence.clear_listeners();
        self.set_participant_count(0);
    }

    /// Publish the presence snapshot, then the changes that led to it.
    fn flush_presence(&mut self) {
        let changes: Vec<PresenceChange> = std::mem::take(
            &mut *self
                .presence_changes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if changes.is_empty() {
            return;
        }
        *self
            .shared
            .presence
            .write()
            .unwrap_or_else(PoisonError::into_inner) = self.presence.snapshot();
        for change in changes {
            let _ = self.shared.presence_events.send(change);
        }
    }
}

/// Presence timestamps follow the tokio clock so paused-time tests apply.
fn now() -> StdInstant {
    Instant::now().into_std()
}

async fn recv_link(link: &mut Option<ChannelLink>) -> Option<RoomEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

async fn connect_result(connecting: &mut Option<ConnectFuture>) -> Result<ChannelLink, ChannelError> {
    match connecting {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn elapsed(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
