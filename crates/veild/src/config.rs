//! Daemon configuration.
//!
//! One TOML file describes the tunnel to run plus daemon tuning. Only the
//! `[tunnel]` section is required; everything else has defaults.
//!
//! ```toml
//! [tunnel]
//! endpoint = "vpn.example.com:51820"
//! private_key = "<base64>"
//! public_key = "<base64>"
//! address = "10.66.66.2/32"
//! # routes = ["0.0.0.0/0"]
//!
//! [interface]
//! name = "veil0"
//! mtu = 1420
//!
//! [reconnect]
//! base_delay_ms = 2000
//! max_delay_ms = 30000
//! max_attempts = 5
//!
//! [daemon]
//! preferences = "/var/lib/veil/veil.json"
//! kill_switch = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use veil_session::{
    Cidr, ConnectionParameters, Credential, Endpoint, ParamError, ReconnectConfig, SessionConfig,
};
use veil_tun::DEFAULT_MTU;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Params(#[from] ParamError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub interface: InterfaceSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub daemon: DaemonSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    /// Remote endpoint, `host:port`.
    pub endpoint: String,
    pub private_key: String,
    pub public_key: String,
    /// Local tunnel address, `ip/prefix`.
    pub address: String,
    /// Prefixes routed through the tunnel. Empty means everything
    /// (`0.0.0.0/0`).
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterfaceSection {
    pub name: String,
    pub mtu: u16,
}

impl Default for InterfaceSection {
    fn default() -> Self {
        Self {
            name: "veil0".to_string(),
            mtu: DEFAULT_MTU,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub clear_intent_on_give_up: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            max_attempts: defaults.max_attempts,
            clear_intent_on_give_up: defaults.clear_intent_on_give_up,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Where session preferences (stay-connected intent, kill switch) live.
    pub preferences: PathBuf,
    /// Kill-switch preference applied at startup.
    pub kill_switch: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            preferences: PathBuf::from("/var/lib/veil/veil.json"),
            kill_switch: false,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Connection parameters from the `[tunnel]` section.
    pub fn parameters(&self) -> Result<ConnectionParameters, ConfigError> {
        let endpoint: Endpoint = self.tunnel.endpoint.parse()?;
        let address: Cidr = self.tunnel.address.parse()?;
        let mut params = ConnectionParameters::new(
            endpoint,
            address,
            Credential::new(self.tunnel.private_key.clone()),
            Credential::new(self.tunnel.public_key.clone()),
        );
        params.routed_prefixes = self
            .tunnel
            .routes
            .iter()
            .map(|route| route.parse::<Cidr>())
            .collect::<Result<_, _>>()?;
        Ok(params)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                max_attempts: self.reconnect.max_attempts,
                clear_intent_on_give_up: self.reconnect.clear_intent_on_give_up,
            },
            mtu: self.interface.mtu,
        }
    }
}
