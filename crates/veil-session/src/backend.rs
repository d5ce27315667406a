//! Tunnel backend capability.
//!
//! Establishing the remote side of the tunnel (resolving the peer, any
//! handshake, any cryptography) belongs to a collaborator. The session
//! worker hands it validated parameters and gets back a live
//! [`TunnelTransport`] for the forwarding loop, or an establishment error it
//! maps onto the connect outcome.

use std::sync::Arc;

use async_trait::async_trait;

use veil_tun::{EstablishError, TunnelTransport};

use crate::params::ConnectionParameters;

/// Capability to bring up the remote side of a tunnel session.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    async fn establish(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn TunnelTransport>, EstablishError>;
}
