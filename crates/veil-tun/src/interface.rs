//! Tunnel interface ownership.
//!
//! [`TunnelInterface`] is the single place handles are born and die: it asks
//! the [`PipeProvider`] for a configured pipe, wraps it in a fresh-generation
//! [`TunnelHandle`], and guarantees at most one handle is live at a time. A
//! handle left over from a previous session is released before the next one
//! is acquired, never carried across two logical sessions.

use std::sync::Arc;

use tracing::{debug, info};

use crate::handle::TunnelHandle;
use crate::pipe::{EstablishError, InterfaceConfig, PipeProvider};

pub struct TunnelInterface {
    provider: Arc<dyn PipeProvider>,
    live: Option<TunnelHandle>,
    next_generation: u64,
}

impl TunnelInterface {
    pub fn new(provider: Arc<dyn PipeProvider>) -> Self {
        Self {
            provider,
            live: None,
            next_generation: 1,
        }
    }

    /// Acquire a configured pipe, releasing any previous live handle first.
    pub async fn acquire(
        &mut self,
        config: &InterfaceConfig,
    ) -> Result<TunnelHandle, EstablishError> {
        self.release();
        let pipe = self.provider.open(config).await?;
        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = TunnelHandle::new(pipe, generation);
        self.live = Some(handle.clone());
        info!(
            "tunnel interface up: {}/{} mtu {} (generation {})",
            config.address, config.prefix_len, config.mtu, generation
        );
        Ok(handle)
    }

    /// Release the live handle if there is one. Best-effort and idempotent.
    pub fn release(&mut self) {
        if let Some(handle) = self.live.take() {
            debug!("releasing tunnel interface (generation {})", handle.generation());
            handle.release();
        }
    }

    /// Currently live handle, if any.
    pub fn live(&self) -> Option<&TunnelHandle> {
        self.live.as_ref()
    }
}
