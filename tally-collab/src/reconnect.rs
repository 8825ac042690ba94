//! Connection lifecycle as an explicit transition table.
//!
//! ```text
//!                 Connect                      ChannelOpened
//!  Disconnected ───────────► Connecting ─────────────────────► (join sent)
//!       ▲                      ▲    │                               │
//!       │         RetryElapsed │    │ ConnectFailed / ChannelLost   │ Joined{n}
//!       │                      │    ▼                               ▼
//!       └──── backoff ◄──── Disconnected ◄──── ChannelLost ─── Joined(Unsynced)
//!                              │                                    │
//!                 attempts ≥ max                           HandshakeComplete
//!                              ▼                                    ▼
//!                       ConnectionLost                       Joined(Synced)
//!
//!  any state ──Close──► Closed(Requested)    any state ──ReplicaFault──► Closed(ReplicaFault)
//! ```
//!
//! While a retry is pending the state is `Disconnected`; it turns back to
//! `Connecting` when the next attempt starts.
//!
//! [`Reconnector`] performs no I/O; the connection driver feeds it events and
//! carries out the returned [`LinkAction`].

use std::time::Duration;

/// Whether the replica has caught up with the room on the current channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Unsynced,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The consumer called `close()` or dropped the session.
    Requested,
    /// A well-formed update could not be applied to the replica.
    ReplicaFault,
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No channel. Also the state while waiting to retry.
    Disconnected,
    /// Opening a channel or waiting for the join ack.
    Connecting,
    Joined(SyncStatus),
    /// Retries exhausted. `connect()` starts over.
    ConnectionLost,
    /// Terminal.
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_joined(&self) -> bool {
        matches!(self, ConnectionState::Joined(_))
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, ConnectionState::Joined(SyncStatus::Synced))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

/// Exponential backoff: `min(initial_delay * 2^attempt, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2500),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Inputs to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Consumer asked to connect.
    Connect,
    /// The connector produced a channel.
    ChannelOpened,
    /// The connector failed.
    ConnectFailed,
    /// Join acknowledged by the room.
    Joined { participant_count: usize },
    HandshakeComplete,
    ChannelLost,
    /// The backoff timer fired.
    RetryElapsed,
    Close,
    ReplicaFault,
}

/// What the driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    OpenChannel,
    SendJoin,
    BeginHandshake { peers_present: bool },
    ScheduleRetry(Duration),
    GiveUp,
    Teardown,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening,
    AwaitingJoin,
    Backoff,
    Joined,
}

#[derive(Debug)]
pub struct Reconnector {
    state: ConnectionState,
    phase: Phase,
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            phase: Phase::Idle,
            policy,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful join.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn handle(&mut self, event: LinkEvent) -> LinkAction {
        if self.state.is_closed() {
            return LinkAction::Nothing;
        }

        match (event, self.phase) {
            (LinkEvent::Close, _) => self.close(CloseReason::Requested),
            (LinkEvent::ReplicaFault, _) => self.close(CloseReason::ReplicaFault),

            (LinkEvent::Connect, Phase::Idle) => {
                self.attempts = 0;
                self.state = ConnectionState::Connecting;
                self.phase = Phase::Opening;
                LinkAction::OpenChannel
            }
            (LinkEvent::ChannelOpened, Phase::Opening) => {
                self.phase = Phase::AwaitingJoin;
                LinkAction::SendJoin
            }
            (LinkEvent::ConnectFailed, Phase::Opening | Phase::AwaitingJoin) => self.fail(),
            (LinkEvent::Joined { participant_count }, Phase::AwaitingJoin) => {
                self.attempts = 0;
                self.phase = Phase::Joined;
                self.state = ConnectionState::Joined(SyncStatus::Unsynced);
                LinkAction::BeginHandshake {
                    peers_present: participant_count > 1,
                }
            }
            (LinkEvent::HandshakeComplete, Phase::Joined) => {
                self.state = ConnectionState::Joined(SyncStatus::Synced);
                LinkAction::Nothing
            }
            (LinkEvent::ChannelLost, Phase::Opening | Phase::AwaitingJoin) => self.fail(),
            (LinkEvent::ChannelLost, Phase::Joined) => {
                self.attempts = 0;
                self.fail()
            }
            (LinkEvent::RetryElapsed, Phase::Backoff) => {
                self.phase = Phase::Opening;
                self.state = ConnectionState::Connecting;
                LinkAction::OpenChannel
            }
            (event, phase) => {
                log::trace!("Ignoring {event:?} in phase {phase:?}");
                LinkAction::Nothing
            }
        }
    }

    fn fail(&mut self) -> LinkAction {
        self.attempts += 1;
        if self.attempts >= self.policy.max_attempts {
            log::warn!("Giving up after {} connection attempts", self.attempts);
            self.phase = Phase::Idle;
            self.state = ConnectionState::ConnectionLost;
            return LinkAction::GiveUp;
        }
        let delay = self.policy.delay_for(self.attempts - 1);
        log::debug!(
            "Connection attempt {} failed, retrying in {:?}",
            self.attempts,
            delay
        );
        self.phase = Phase::Backoff;
        self.state = ConnectionState::Disconnected;
        LinkAction::ScheduleRetry(delay)
    }

    fn close(&mut self, reason: CloseReason) -> LinkAction {
        self.phase = Phase::Idle;
        self.state = ConnectionState::Closed(reason);
        LinkAction::Teardown
    }
}
