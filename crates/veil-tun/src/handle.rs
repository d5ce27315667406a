//! Exclusive tunnel handle.
//!
//! A [`TunnelHandle`] is the only way packets move through the pipe, and the
//! only way they are counted. Releasing the handle closes the pipe, which is
//! what unblocks a read parked inside the forwarding loop; there is no
//! cooperative "please stop" flag to miss.
//!
//! # Behavior
//!
//! - `release` is idempotent.
//! - After `release`, `recv`/`send` fail with [`HandleError::Released`] and
//!   the traffic counters never move again, even for a read that was already
//!   in flight when the release happened.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::counters::TrafficCounters;
use crate::pipe::PacketPipe;

/// Why a handle operation did not complete.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("tunnel handle released")]
    Released,

    #[error("tunnel i/o failed: {0}")]
    Io(#[from] io::Error),
}

struct HandleShared {
    pipe: Arc<dyn PacketPipe>,
    counters: Arc<TrafficCounters>,
    generation: u64,
    released: AtomicBool,
}

/// Cloneable reference to the live tunnel session.
///
/// Clones share the release flag and counters; releasing any clone releases
/// them all.
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<HandleShared>,
}

impl TunnelHandle {
    pub(crate) fn new(pipe: Arc<dyn PacketPipe>, generation: u64) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                pipe,
                counters: Arc::new(TrafficCounters::new()),
                generation,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Monotonic identifier of the session this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Counters for this session; safe to hold across the handle's release.
    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.shared.counters.clone()
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Close the pipe and retire the handle. Safe to call repeatedly.
    pub fn release(&self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.pipe.shutdown();
        debug!(
            "tunnel handle released (generation {})",
            self.shared.generation
        );
    }

    /// Read one packet from the interface, counting it as received.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, HandleError> {
        if self.is_released() {
            return Err(HandleError::Released);
        }
        let len = self.shared.pipe.recv(buf).await?;
        // a release that raced the read must not be accounted
        if self.is_released() {
            return Err(HandleError::Released);
        }
        if len > 0 {
            self.shared.counters.add_received(len as u64);
        }
        Ok(len)
    }

    /// Write one packet to the interface, counting it as sent.
    pub async fn send(&self, packet: &[u8]) -> Result<usize, HandleError> {
        if self.is_released() {
            return Err(HandleError::Released);
        }
        let len = self.shared.pipe.send(packet).await?;
        if self.is_released() {
            return Err(HandleError::Released);
        }
        if len > 0 {
            self.shared.counters.add_sent(len as u64);
        }
        Ok(len)
    }
}
