//! Session counters.
//!
//! Tracked with atomics so the driver task never takes a lock to count;
//! read through [`AtomicSessionStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Room messages handed to the channel.
    pub messages_sent: u64,
    /// Room messages received and decoded.
    pub messages_received: u64,
    /// `Update` frames accepted by the channel, queue flushes included.
    pub updates_sent: u64,
    /// Remote-origin mutations that were not sent back out.
    pub echoes_suppressed: u64,
    /// Messages dropped because they could not be decoded.
    pub malformed_dropped: u64,
    /// Connection attempts made after a failure or channel loss.
    pub reconnects: u64,
}

#[derive(Debug, Default)]
pub struct AtomicSessionStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    updates_sent: AtomicU64,
    echoes_suppressed: AtomicU64,
    malformed_dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl AtomicSessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_sent(&self) {
        self.updates_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_echo_suppressed(&self) {
        self.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
