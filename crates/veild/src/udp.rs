//! Plaintext UDP transport backend.
//!
//! Connects a UDP socket to the configured endpoint and carries tunnel
//! packets as datagrams, verbatim. There is no handshake and no cryptography
//! here: this backend is only appropriate when the path to the peer is
//! already trusted (a relay on a private segment, lab and loopback setups).
//! An encrypting backend plugs into the same [`TunnelBackend`] seam.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{UdpSocket, lookup_host};
use tracing::info;

use veil_session::{ConnectionParameters, TunnelBackend};
use veil_tun::{EstablishError, TunnelTransport};

pub struct UdpTransportBackend;

impl UdpTransportBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UdpTransportBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelBackend for UdpTransportBackend {
    async fn establish(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn TunnelTransport>, EstablishError> {
        let target = params.endpoint.to_string();
        let peer = lookup_host(&target)
            .await
            .map_err(|e| EstablishError::EstablishFailed(format!("resolve {target}: {e}")))?
            .next()
            .ok_or_else(|| {
                EstablishError::EstablishFailed(format!("no addresses for {target}"))
            })?;

        let bind_addr = if peer.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| EstablishError::EstablishFailed(format!("bind: {e}")))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| EstablishError::EstablishFailed(format!("connect {peer}: {e}")))?;

        info!("udp transport connected to {peer}");
        Ok(Arc::new(UdpTransport { socket }))
    }
}

struct UdpTransport {
    socket: UdpSocket,
}

#[async_trait]
impl TunnelTransport for UdpTransport {
    async fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.socket.send(packet).await.map(|_| ())
    }

    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_session::{Cidr, Credential, Endpoint};

    fn params_to(endpoint: Endpoint) -> ConnectionParameters {
        ConnectionParameters::new(
            endpoint,
            "10.66.66.2/32".parse::<Cidr>().unwrap(),
            Credential::new("priv"),
            Credential::new("pub"),
        )
    }

    #[tokio::test]
    async fn test_packets_flow_both_ways() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let backend = UdpTransportBackend::new();
        let endpoint: Endpoint = format!("127.0.0.1:{}", peer_addr.port()).parse().unwrap();
        let transport = backend.establish(&params_to(endpoint)).await.unwrap();

        transport.send_packet(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        let len = transport.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"pong");
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint_fails() {
        let backend = UdpTransportBackend::new();
        let endpoint: Endpoint = "veil.invalid:51820".parse().unwrap();
        let result = backend.establish(&params_to(endpoint)).await;
        assert!(matches!(result, Err(EstablishError::EstablishFailed(_))));
    }
}
