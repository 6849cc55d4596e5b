//! Statistics for relay connections and client sessions
//!
//! Counters are updated from the hot path with relaxed atomics and read
//! through plain snapshot structs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one multicast ingest
#[derive(Debug, Default)]
pub struct IngestCounters {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    truncated: AtomicU64,
    rejected: AtomicU64,
    published: AtomicU64,
}

impl IngestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one datagram read from the socket
    pub fn record_datagram(&self, len: usize) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record a datagram larger than the configured packet size
    pub fn record_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram that carried no MPEG-TS payload
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a payload handed to the fan-out
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes_received: self.bytes.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

/// Connection-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Datagrams read from the multicast socket
    pub datagrams: u64,
    /// Bytes read from the multicast socket
    pub bytes_received: u64,
    /// Datagrams cut to the configured packet size
    pub truncated: u64,
    /// Datagrams skipped because they carried no MPEG-TS payload
    pub rejected: u64,
    /// Payloads handed to the fan-out
    pub published: u64,
}

/// Live counters of one client session
#[derive(Debug, Default)]
pub struct SessionCounters {
    sent: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one payload written to the consumer
    pub fn record_sent(&self, len: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record a payload discarded by the drop-oldest policy
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            packets_sent: self.sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes.load(Ordering::Relaxed),
            packets_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Session-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Payloads written to the consumer
    pub packets_sent: u64,
    /// Bytes written to the consumer
    pub bytes_sent: u64,
    /// Payloads discarded because the consumer fell behind
    pub packets_dropped: u64,
}

impl SessionStats {
    /// Share of payloads lost to backpressure, in percent
    pub fn drop_ratio(&self) -> f64 {
        let total = self.packets_sent + self.packets_dropped;
        if total == 0 {
            0.0
        } else {
            self.packets_dropped as f64 * 100.0 / total as f64
        }
    }
}
