//! Packet pipe over a real TUN device.
//!
//! Creates the interface with `tun-rs` (address, MTU, brought up by the
//! builder) and installs the routed prefixes through `net-route`. Routes are
//! bound to the interface, so the kernel drops them with the device; no
//! explicit cleanup is needed when a session ends.
//!
//! Requires root or `CAP_NET_ADMIN`.

use std::ffi::CString;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};
use tun_rs::{AsyncDevice, DeviceBuilder};

use veil_tun::{EstablishError, InterfaceConfig, PacketPipe, PipeProvider};

/// [`PipeProvider`] backed by a kernel TUN device.
pub struct TunPipeProvider {
    name: String,
}

impl TunPipeProvider {
    /// `name` is the interface name to create, e.g. `veil0`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl PipeProvider for TunPipeProvider {
    async fn open(
        &self,
        config: &InterfaceConfig,
    ) -> Result<Arc<dyn PacketPipe>, EstablishError> {
        let mut builder = DeviceBuilder::new().name(&self.name).mtu(config.mtu);
        builder = match config.address {
            IpAddr::V4(address) => builder.ipv4(address, config.prefix_len, None),
            IpAddr::V6(address) => builder.ipv6(address, config.prefix_len),
        };
        let device = builder.build_async().map_err(establish_error)?;
        let name = device.name().map_err(establish_error)?;
        install_routes(&name, &config.routes).await?;
        info!(
            "tun device {} up: {}/{} mtu {}",
            name, config.address, config.prefix_len, config.mtu
        );

        let (closed_tx, closed_rx) = watch::channel(false);
        Ok(Arc::new(TunPipe {
            device,
            closed_tx,
            closed_rx,
        }))
    }
}

struct TunPipe {
    device: AsyncDevice,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl PacketPipe for TunPipe {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.closed_rx.borrow() {
            return Err(closed_error());
        }
        let mut closed = self.closed_rx.clone();
        tokio::select! {
            // wait_for re-checks the current value, so a shutdown racing
            // this call cannot be missed
            _ = closed.wait_for(|closed| *closed) => Err(closed_error()),
            result = self.device.recv(buf) => result,
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if *self.closed_rx.borrow() {
            return Err(closed_error());
        }
        self.device.send(packet).await
    }

    fn shutdown(&self) {
        self.closed_tx.send_replace(true);
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tun device closed")
}

fn establish_error(error: io::Error) -> EstablishError {
    if error.kind() == io::ErrorKind::PermissionDenied {
        EstablishError::PermissionDenied
    } else {
        EstablishError::EstablishFailed(error.to_string())
    }
}

async fn install_routes(
    interface: &str,
    routes: &[(IpAddr, u8)],
) -> Result<(), EstablishError> {
    if routes.is_empty() {
        return Ok(());
    }
    let handle = net_route::Handle::new().map_err(establish_error)?;
    let ifindex = interface_index(interface)?;
    for (destination, prefix) in routes {
        let route = net_route::Route::new(*destination, *prefix).with_ifindex(ifindex);
        match handle.add(&route).await {
            Ok(()) => debug!("route {destination}/{prefix} dev {interface}"),
            Err(error) => {
                // EEXIST: the route survived an earlier session on the same
                // device name
                let text = error.to_string();
                if error.kind() == io::ErrorKind::AlreadyExists || text.contains("File exists") {
                    debug!("route {destination}/{prefix} already present");
                } else {
                    return Err(EstablishError::EstablishFailed(format!(
                        "route {destination}/{prefix}: {error}"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn interface_index(name: &str) -> Result<u32, EstablishError> {
    let c_name = CString::new(name)
        .map_err(|_| EstablishError::EstablishFailed("invalid interface name".to_string()))?;
    // SAFETY: if_nametoindex only reads the provided C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(EstablishError::EstablishFailed(format!(
            "interface {name} not found"
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_map_to_permission_denied() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "EPERM");
        assert_eq!(establish_error(denied), EstablishError::PermissionDenied);

        let other = io::Error::new(io::ErrorKind::NotFound, "no such device");
        assert!(matches!(
            establish_error(other),
            EstablishError::EstablishFailed(_)
        ));
    }

    #[test]
    fn test_unknown_interface_has_no_index() {
        assert!(interface_index("veil-test-does-not-exist").is_err());
    }
}
