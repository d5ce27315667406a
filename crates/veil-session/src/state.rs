//! Connection state and status snapshots.
//!
//! There is exactly one [`ConnectionState`] per session manager, mutated
//! only by its worker. Error and Disconnected are not dead ends: a new
//! connect request leaves either of them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the managed tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No tunnel, no intent to have one.
    Disconnected,
    /// A user-initiated establishment attempt is running.
    Connecting,
    /// Tunnel up, forwarding loop running.
    Connected,
    /// Tunnel lost, recovery attempts scheduled.
    Reconnecting,
    /// Establishment failed or retries were exhausted; waiting for the user.
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while the manager is actively trying to bring a tunnel up.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One consistent view of the session: the state and the byte counters that
/// belong to the same tunnel generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StatusSnapshot {
    pub fn idle(state: ConnectionState) -> Self {
        Self {
            state,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}
