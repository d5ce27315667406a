//! In-memory packet pipe.
//!
//! A channel-backed [`PacketPipe`] for tests and loopback setups. The far
//! end is a [`MemoryPipeRemote`] that injects packets (surfaced through
//! `recv`) and observes packets the near end `send`s.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};

use crate::pipe::PacketPipe;

const CHANNEL_CAPACITY: usize = 64;

/// Channel-backed packet pipe.
pub struct MemoryPipe {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

/// Far end of a [`MemoryPipe`].
pub struct MemoryPipeRemote {
    to_pipe: mpsc::Sender<Vec<u8>>,
    from_pipe: mpsc::Receiver<Vec<u8>>,
}

impl MemoryPipe {
    /// Create a connected pipe/remote pair.
    pub fn pair() -> (Arc<MemoryPipe>, MemoryPipeRemote) {
        let (to_pipe, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, from_pipe) = mpsc::channel(CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        let pipe = Arc::new(MemoryPipe {
            inbound: Mutex::new(inbound),
            outbound,
            closed_tx,
            closed_rx,
        });
        let remote = MemoryPipeRemote { to_pipe, from_pipe };
        (pipe, remote)
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "packet pipe closed")
    }
}

#[async_trait]
impl PacketPipe for MemoryPipe {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.closed_rx.borrow() {
            return Err(Self::closed_error());
        }
        let mut inbound = self.inbound.lock().await;
        let mut closed = self.closed_rx.clone();
        tokio::select! {
            // wait_for re-checks the current value, so a shutdown racing
            // this call cannot be missed
            _ = closed.wait_for(|closed| *closed) => Err(Self::closed_error()),
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    Ok(len)
                }
                None => Err(Self::closed_error()),
            },
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if *self.closed_rx.borrow() {
            return Err(Self::closed_error());
        }
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| Self::closed_error())?;
        Ok(packet.len())
    }

    fn shutdown(&self) {
        self.closed_tx.send_replace(true);
    }
}

impl MemoryPipeRemote {
    /// Queue a packet for the pipe's next `recv`. Returns false if the pipe
    /// is gone.
    pub async fn inject(&self, packet: &[u8]) -> bool {
        self.to_pipe.send(packet.to_vec()).await.is_ok()
    }

    /// Next packet the pipe `send`s, or None once the pipe is dropped.
    pub async fn next_sent(&mut self) -> Option<Vec<u8>> {
        self.from_pipe.recv().await
    }
}
