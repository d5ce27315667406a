//! Kill switch preference.
//!
//! The session stores the user's kill-switch choice and derives whether
//! non-tunnel traffic should currently be blocked (enabled while the tunnel
//! is down). Actual packet blocking is a platform firewall concern; hosts
//! read [`KillSwitch::state`] and enforce it themselves.

use std::sync::atomic::{AtomicBool, Ordering};

/// Observable kill-switch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// Preference off; traffic is never blocked.
    Disabled,
    /// Preference on, tunnel up: nothing to block right now.
    Standby,
    /// Preference on, tunnel down: non-tunnel traffic should be blocked.
    Blocking,
}

/// Kill-switch preference plus the tunnel-up signal it derives from.
#[derive(Debug)]
pub struct KillSwitch {
    enabled: AtomicBool,
    tunnel_up: AtomicBool,
}

impl KillSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            tunnel_up: AtomicBool::new(false),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn on_tunnel_up(&self) {
        self.tunnel_up.store(true, Ordering::Release);
    }

    pub(crate) fn on_tunnel_down(&self) {
        self.tunnel_up.store(false, Ordering::Release);
    }

    pub fn state(&self) -> KillSwitchState {
        if !self.is_enabled() {
            KillSwitchState::Disabled
        } else if self.tunnel_up.load(Ordering::Acquire) {
            KillSwitchState::Standby
        } else {
            KillSwitchState::Blocking
        }
    }

    /// True when a platform firewall should be dropping non-tunnel traffic.
    pub fn is_blocking(&self) -> bool {
        self.state() == KillSwitchState::Blocking
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_blocks() {
        let kill_switch = KillSwitch::new(false);
        assert_eq!(kill_switch.state(), KillSwitchState::Disabled);
        kill_switch.on_tunnel_up();
        kill_switch.on_tunnel_down();
        assert!(!kill_switch.is_blocking());
    }

    #[test]
    fn test_enabled_blocks_while_tunnel_down() {
        let kill_switch = KillSwitch::new(true);
        assert_eq!(kill_switch.state(), KillSwitchState::Blocking);

        kill_switch.on_tunnel_up();
        assert_eq!(kill_switch.state(), KillSwitchState::Standby);
        assert!(!kill_switch.is_blocking());

        kill_switch.on_tunnel_down();
        assert_eq!(kill_switch.state(), KillSwitchState::Blocking);
    }

    #[test]
    fn test_toggle_at_runtime() {
        let kill_switch = KillSwitch::new(false);
        kill_switch.set_enabled(true);
        assert!(kill_switch.is_blocking());
        kill_switch.set_enabled(false);
        assert_eq!(kill_switch.state(), KillSwitchState::Disabled);
    }
}
