//! Per-handle traffic accounting.
//!
//! Counters are owned by a [`TunnelHandle`](crate::TunnelHandle) and start at
//! zero for every established session. They only ever grow while the handle
//! is live; once the handle is released nothing increments them again, so a
//! status reader holding a reference sees the final totals of that session.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic byte counters for one tunnel session.
///
/// `bytes_sent` counts packets written into the tunnel interface,
/// `bytes_received` counts packets read out of it.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}
