//! Tunnel transport seam.
//!
//! The remote side of the tunnel (handshake, encryption, socket plumbing) is
//! a collaborator behind [`TunnelTransport`]: the forwarding loop hands it
//! every packet read from the interface and writes back every packet it
//! produces. This crate makes no assumptions about what the transport does
//! in between.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

/// Packet sink/source for one established tunnel session.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Carry one outbound packet to the remote endpoint.
    async fn send_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// Wait for the next inbound packet, writing it into `buf` and returning
    /// its length. A zero-length packet means "nothing yet".
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize>;
}

const CHANNEL_CAPACITY: usize = 64;

/// Channel-backed transport for tests.
///
/// Dropping the [`MemoryTransportRemote`] ends the session: the next
/// `send_packet`/`recv_packet` fails the way a dead socket would.
pub struct MemoryTransport {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// Far end of a [`MemoryTransport`].
pub struct MemoryTransportRemote {
    to_transport: mpsc::Sender<Vec<u8>>,
    from_transport: mpsc::Receiver<Vec<u8>>,
}

impl MemoryTransport {
    /// Create a connected transport/remote pair.
    pub fn pair() -> (Arc<MemoryTransport>, MemoryTransportRemote) {
        let (to_transport, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, from_transport) = mpsc::channel(CHANNEL_CAPACITY);
        let transport = Arc::new(MemoryTransport {
            inbound: Mutex::new(inbound),
            outbound,
        });
        let remote = MemoryTransportRemote {
            to_transport,
            from_transport,
        };
        (transport, remote)
    }

    fn dead_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "tunnel transport closed")
    }
}

#[async_trait]
impl TunnelTransport for MemoryTransport {
    async fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| Self::dead_error())
    }

    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => Err(Self::dead_error()),
        }
    }
}

impl MemoryTransportRemote {
    /// Queue an inbound packet. Returns false if the transport is gone.
    pub async fn inject(&self, packet: &[u8]) -> bool {
        self.to_transport.send(packet.to_vec()).await.is_ok()
    }

    /// Next packet the transport carried outbound, or None once the
    /// transport is dropped.
    pub async fn next_sent(&mut self) -> Option<Vec<u8>> {
        self.from_transport.recv().await
    }
}
