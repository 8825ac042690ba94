//! Session configuration.

use std::time::Duration;

use crate::presence::DEFAULT_TIMEOUT;
use crate::reconnect::ReconnectPolicy;

/// Tunables for a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remote presence entries not refreshed within this window are dropped
    pub presence_timeout: Duration,
    /// How often the liveness timeout is applied and local presence renewed
    pub presence_check_interval: Duration,
    /// How long to wait for a Step2 before re-sending Step1
    pub handshake_timeout: Duration,
    /// Backoff between connection attempts
    pub reconnect: ReconnectPolicy,
    /// Local updates held while not synced before collapsing to full state
    pub pending_capacity: usize,
    /// Presence change events buffered per subscriber
    pub presence_event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            presence_timeout: DEFAULT_TIMEOUT,
            presence_check_interval: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            pending_capacity: 10_000,
            presence_event_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    pub fn with_presence_check_interval(mut self, interval: Duration) -> Self {
        self.presence_check_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    pub fn with_presence_event_capacity(mut self, capacity: usize) -> Self {
        self.presence_event_capacity = capacity.max(1);
        self
    }
}
