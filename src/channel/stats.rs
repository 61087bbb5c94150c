//! Channel Statistics
//!
//! Lock-free counters updated by the reader and writer tasks, plus a
//! plain-value [`StatsSnapshot`] for reporting.

use crate::connection::ConnectionStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for command traffic on one channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Commands written to the wire
    pub commands_sent: AtomicU64,
    /// Replies delivered to a waiting caller
    pub responses_matched: AtomicU64,
    /// Replies whose caller had already given up
    pub stale_replies: AtomicU64,
    /// Lines received with no request outstanding
    pub unsolicited_lines: AtomicU64,
    /// Commands dropped before being written because the caller gave up
    pub cancelled_unsent: AtomicU64,
    /// Calls that hit their deadline
    pub timeouts: AtomicU64,
    /// Connections lost while established
    pub connection_losses: AtomicU64,
    /// Successful automatic or manual reconnects
    pub reconnects: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a delivered reply and its round-trip time.
    pub fn response_matched(&self, latency: Duration) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_reply(&self) {
        self.stale_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsolicited_line(&self) {
        self.unsolicited_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled_unsent(&self) {
        self.cancelled_unsent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean round-trip time over all delivered replies.
    pub fn mean_latency(&self) -> Option<Duration> {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return None;
        }
        let total = self.latency_micros.load(Ordering::Relaxed);
        Some(Duration::from_micros(total / samples))
    }

    /// Combines these counters with the socket-level ones.
    pub fn snapshot(&self, connection: &ConnectionStats) -> StatsSnapshot {
        StatsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            unsolicited_lines: self.unsolicited_lines.load(Ordering::Relaxed),
            cancelled_unsent: self.cancelled_unsent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connection_losses: self.connection_losses.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connects: connection.connects.load(Ordering::Relaxed),
            connect_failures: connection.connect_failures.load(Ordering::Relaxed),
            bytes_read: connection.bytes_read.load(Ordering::Relaxed),
            bytes_written: connection.bytes_written.load(Ordering::Relaxed),
            mean_latency: self.mean_latency(),
        }
    }
}

/// Point-in-time copy of all channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub commands_sent: u64,
    pub responses_matched: u64,
    pub stale_replies: u64,
    pub unsolicited_lines: u64,
    pub cancelled_unsent: u64,
    pub timeouts: u64,
    pub connection_losses: u64,
    pub reconnects: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub mean_latency: Option<Duration>,
}
