//! Network change events.
//!
//! Connectivity changes reach the session worker as plain values over a
//! broadcast channel; the observer never touches session state itself. The
//! worker subscribes when a session comes up, keeps the subscription through
//! reconnection, and drops it once the session is disconnected or parked in
//! the error state.

use tokio::sync::broadcast;

/// Connectivity change reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The network currently carrying the tunnel went away.
    Lost,
    /// A usable network appeared.
    Available,
    /// Properties of the current network changed (e.g. captive portal
    /// cleared, link type switched).
    CapabilitiesChanged,
}

/// Source of [`NetworkEvent`]s.
pub trait NetworkMonitor: Send + Sync {
    /// A fresh subscription to future events.
    fn events(&self) -> broadcast::Receiver<NetworkEvent>;
}

const EVENT_CAPACITY: usize = 16;

/// A monitor driven explicitly by the host (or a test).
pub struct ManualMonitor {
    sender: broadcast::Sender<NetworkEvent>,
}

impl ManualMonitor {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Deliver an event to every current subscriber.
    pub fn emit(&self, event: NetworkEvent) {
        // no subscribers is fine, nobody is connected
        let _ = self.sender.send(event);
    }
}

impl Default for ManualMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor for ManualMonitor {
    fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let monitor = ManualMonitor::new();
        let mut events = monitor.events();
        monitor.emit(NetworkEvent::Lost);
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::Lost);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_harmless() {
        let monitor = ManualMonitor::new();
        monitor.emit(NetworkEvent::Available);

        // events sent before subscribing are not delivered
        let mut events = monitor.events();
        monitor.emit(NetworkEvent::CapabilitiesChanged);
        assert_eq!(
            events.recv().await.unwrap(),
            NetworkEvent::CapabilitiesChanged
        );
    }
}
