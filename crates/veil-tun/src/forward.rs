//! Packet forwarding loop.
//!
//! Two dedicated tasks per session: uplink drains the tunnel interface into
//! the transport, downlink drains the transport into the interface. Neither
//! shares an execution context with whoever called connect, so a parked read
//! never blocks control operations.
//!
//! # Failure reporting
//!
//! An I/O error on a still-live handle is reported once through the failure
//! channel, tagged with the handle's generation, and the task exits. Errors
//! observed after the handle was released are the expected debris of
//! teardown (the release closed the pipe under a pending read) and are
//! swallowed at debug level.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::handle::{HandleError, TunnelHandle};
use crate::transport::TunnelTransport;

/// Read buffer size, comfortably above any expected link MTU plus framing.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Report of a forwarding task dying while its handle was still live.
#[derive(Debug)]
pub struct LoopFailure {
    /// Generation of the handle the failure belongs to.
    pub generation: u64,
    pub error: io::Error,
}

/// Running forwarding tasks for one tunnel session.
pub struct ForwardingLoop {
    uplink: JoinHandle<()>,
    downlink: JoinHandle<()>,
}

impl ForwardingLoop {
    /// Start forwarding between `handle` and `transport`.
    ///
    /// Failures while the handle is live go to `failures`; the loop stops on
    /// its own once the handle is released.
    pub fn spawn(
        handle: TunnelHandle,
        transport: Arc<dyn TunnelTransport>,
        failures: mpsc::Sender<LoopFailure>,
    ) -> Self {
        let uplink = tokio::spawn(run_uplink(
            handle.clone(),
            transport.clone(),
            failures.clone(),
        ));
        let downlink = tokio::spawn(run_downlink(handle, transport, failures));
        Self { uplink, downlink }
    }

    /// Abort both tasks. Releasing the handle already makes them exit; this
    /// just avoids waiting for the next I/O wakeup.
    pub fn stop(&self) {
        self.uplink.abort();
        self.downlink.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.uplink.is_finished() && self.downlink.is_finished()
    }

    /// Wait for both tasks to exit.
    pub async fn join(self) {
        let _ = self.uplink.await;
        let _ = self.downlink.await;
    }
}

async fn run_uplink(
    handle: TunnelHandle,
    transport: Arc<dyn TunnelTransport>,
    failures: mpsc::Sender<LoopFailure>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match handle.recv(&mut buf).await {
            Ok(0) => {
                // no data right now, not an error
                trace!("uplink: empty read");
            }
            Ok(len) => {
                if let Err(error) = transport.send_packet(&buf[..len]).await {
                    report(&failures, &handle, "uplink", error).await;
                    break;
                }
            }
            Err(HandleError::Released) => {
                debug!("uplink: handle released, exiting");
                break;
            }
            Err(HandleError::Io(error)) => {
                report(&failures, &handle, "uplink", error).await;
                break;
            }
        }
    }
}

async fn run_downlink(
    handle: TunnelHandle,
    transport: Arc<dyn TunnelTransport>,
    failures: mpsc::Sender<LoopFailure>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match transport.recv_packet(&mut buf).await {
            Ok(0) => {
                trace!("downlink: empty packet");
            }
            Ok(len) => match handle.send(&buf[..len]).await {
                Ok(_) => {}
                Err(HandleError::Released) => {
                    debug!("downlink: handle released, exiting");
                    break;
                }
                Err(HandleError::Io(error)) => {
                    report(&failures, &handle, "downlink", error).await;
                    break;
                }
            },
            Err(error) => {
                report(&failures, &handle, "downlink", error).await;
                break;
            }
        }
    }
}

async fn report(
    failures: &mpsc::Sender<LoopFailure>,
    handle: &TunnelHandle,
    direction: &str,
    error: io::Error,
) {
    if handle.is_released() {
        debug!("{direction}: i/o error after release, ignoring: {error}");
        return;
    }
    warn!("{direction}: tunnel i/o failed: {error}");
    let failure = LoopFailure {
        generation: handle.generation(),
        error,
    };
    if failures.send(failure).await.is_err() {
        debug!("{direction}: failure listener gone");
    }
}
