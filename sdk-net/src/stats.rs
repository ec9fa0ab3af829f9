//! In-process counters for upstream health reporting.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// A monotonically increasing counter.
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current counter value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Connection-layer counters shared by every component of one network.
pub struct NetworkStats {
    /// Dial attempts, initial connect and reconnect passes alike.
    pub connect_attempts: Counter,
    /// Dials that failed before TLS.
    pub connect_failures: Counter,
    pub secure_handshake_failures: Counter,
    pub negotiation_failures: Counter,
    /// Peers brought back by a reconnect pass.
    pub reconnects: Counter,
    pub requests_sent: Counter,
    pub requests_timed_out: Counter,
    pub connections_lost: Counter,
}

impl NetworkStats {
    pub fn new() -> Self {
        Self {
            connect_attempts: Counter::new("sdk_net_connect_attempts_total"),
            connect_failures: Counter::new("sdk_net_connect_failures_total"),
            secure_handshake_failures: Counter::new("sdk_net_secure_handshake_failures_total"),
            negotiation_failures: Counter::new("sdk_net_negotiation_failures_total"),
            reconnects: Counter::new("sdk_net_reconnects_total"),
            requests_sent: Counter::new("sdk_net_requests_sent_total"),
            requests_timed_out: Counter::new("sdk_net_requests_timed_out_total"),
            connections_lost: Counter::new("sdk_net_connections_lost_total"),
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connect_attempts: self.connect_attempts.get(),
            connect_failures: self.connect_failures.get(),
            secure_handshake_failures: self.secure_handshake_failures.get(),
            negotiation_failures: self.negotiation_failures.get(),
            reconnects: self.reconnects.get(),
            requests_sent: self.requests_sent.get(),
            requests_timed_out: self.requests_timed_out.get(),
            connections_lost: self.connections_lost.get(),
        }
    }

    fn counters(&self) -> [&Counter; 8] {
        [
            &self.connect_attempts,
            &self.connect_failures,
            &self.secure_handshake_failures,
            &self.negotiation_failures,
            &self.reconnects,
            &self.requests_sent,
            &self.requests_timed_out,
            &self.connections_lost,
        ]
    }
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NetworkStats {
    /// One `name value` line per counter.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for counter in self.counters() {
            writeln!(f, "{} {}", counter.name(), counter.get())?;
        }
        Ok(())
    }
}

/// Plain values read from [`NetworkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub secure_handshake_failures: u64,
    pub negotiation_failures: u64,
    pub reconnects: u64,
    pub requests_sent: u64,
    pub requests_timed_out: u64,
    pub connections_lost: u64,
}

// ── Tests ───────────────────────────────────────────────────────────────────
