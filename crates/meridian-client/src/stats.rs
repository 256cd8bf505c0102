//! Producer statistics.
//!
//! Lock-free counters updated on the send, flush and completion paths, and a
//! serializable point-in-time snapshot for dashboards and logs.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct ProducerStats {
    messages_sent: AtomicU64,
    messages_acked: AtomicU64,
    messages_failed: AtomicU64,
    messages_timed_out: AtomicU64,
    bytes_sent: AtomicU64,
    batches_sent: AtomicU64,
    encryption_failures: AtomicU64,
}

impl ProducerStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, payload_bytes: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self, count: u64) {
        self.messages_acked.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, count: u64) {
        self.messages_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.messages_timed_out.fetch_add(1, Ordering::Relaxed);
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_encryption_failure(&self) {
        self.encryption_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_timed_out: self.messages_timed_out.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            encryption_failures: self.encryption_failures.load(Ordering::Relaxed),
        }
    }
}

/// Producer statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProducerStatsSnapshot {
    /// Messages accepted by `send_async`
    pub messages_sent: u64,
    /// Messages acknowledged by the broker
    pub messages_acked: u64,
    /// Messages resolved with any error, timeouts included
    pub messages_failed: u64,
    /// Messages that exceeded `send_timeout`
    pub messages_timed_out: u64,
    /// Frame payload bytes handed to partition connections
    pub bytes_sent: u64,
    /// Frames handed to partition connections
    pub batches_sent: u64,
    /// Batches whose encryption failed (sent or not)
    pub encryption_failures: u64,
}

impl ProducerStatsSnapshot {
    /// Messages accepted but not yet terminal.
    pub fn pending(&self) -> u64 {
        self.messages_sent
            .saturating_sub(self.messages_acked + self.messages_failed)
    }

    pub fn success_rate(&self) -> f64 {
        let done = self.messages_acked + self.messages_failed;
        if done == 0 {
            1.0
        } else {
            self.messages_acked as f64 / done as f64
        }
    }
}
