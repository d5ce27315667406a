//! Platform packet pipe capability.
//!
//! The virtual network interface is not created by this crate. The host
//! supplies a [`PipeProvider`] that knows how to ask the operating system for
//! a routed interface; what comes back is a [`PacketPipe`], a duplex stream
//! of raw packets. On a real system the provider wraps a TUN device; tests
//! use [`MemoryPipe`](crate::MemoryPipe).

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

/// Default interface MTU. Leaves headroom for tunnel framing on a
/// 1500-byte link.
pub const DEFAULT_MTU: u16 = 1420;

/// How the provider should configure the virtual interface.
///
/// Name resolution is intentionally absent: no DNS servers are pushed into
/// the tunnel, the operating system's resolver keeps working unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Local tunnel address.
    pub address: IpAddr,
    /// Prefix length for `address`.
    pub prefix_len: u8,
    /// Prefixes routed through the tunnel, as (network, prefix length).
    pub routes: Vec<(IpAddr, u8)>,
    /// Interface MTU.
    pub mtu: u16,
}

/// Reasons the platform refused to hand out a packet pipe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EstablishError {
    #[error("permission to create the tunnel interface was denied")]
    PermissionDenied,

    #[error("tunnel establishment failed: {0}")]
    EstablishFailed(String),
}

/// Duplex raw-packet stream over the virtual interface.
///
/// `recv` may block indefinitely; [`shutdown`](PacketPipe::shutdown) must
/// force any blocked `recv` to return an error promptly. A zero-length
/// `recv` means "no data right now" and is not an error.
#[async_trait]
pub trait PacketPipe: Send + Sync {
    /// Read one packet into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet, returning the number of bytes accepted.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Close the pipe. Idempotent; unblocks pending reads.
    fn shutdown(&self);
}

/// Capability to create configured packet pipes.
#[async_trait]
pub trait PipeProvider: Send + Sync {
    async fn open(&self, config: &InterfaceConfig) -> Result<Arc<dyn PacketPipe>, EstablishError>;
}
