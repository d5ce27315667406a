//! Connection parameters and validation.
//!
//! Parameters are immutable once an establishment attempt starts. Validation
//! happens synchronously at connect time: a malformed endpoint or address is
//! rejected before any state transition and is never retried.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use veil_tun::InterfaceConfig;

/// What made a set of connection parameters unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("invalid endpoint {0:?}: expected host:port")]
    Endpoint(String),

    #[error("invalid port in endpoint {0:?}")]
    Port(String),

    #[error("invalid address {0:?}: expected ip/prefix")]
    Address(String),

    #[error("prefix length {prefix} out of range for {address}")]
    PrefixLength { address: IpAddr, prefix: u8 },

    #[error("{0} credential must not be empty")]
    EmptyCredential(&'static str),
}

/// Remote tunnel endpoint, exactly `host:port`.
///
/// The host part may not itself contain a colon; a bracketed IPv6 endpoint
/// is not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (host, port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) if !host.is_empty() => (host, port),
            _ => return Err(ParamError::Endpoint(s.to_string())),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| ParamError::Port(s.to_string()))?;
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An IP network in `ip/prefix` form, used both for the local tunnel address
/// and for routed prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub ip: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, ParamError> {
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(ParamError::PrefixLength {
                address: ip,
                prefix: prefix_len,
            });
        }
        Ok(Cidr { ip, prefix_len })
    }

    /// `0.0.0.0/0`: route everything through the tunnel.
    pub fn default_route() -> Self {
        Cidr {
            ip: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    fn check(&self) -> Result<(), ParamError> {
        Self::new(self.ip, self.prefix_len).map(|_| ())
    }
}

impl FromStr for Cidr {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = s
            .split_once('/')
            .ok_or_else(|| ParamError::Address(s.to_string()))?;
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| ParamError::Address(s.to_string()))?;
        let prefix_len = prefix
            .parse::<u8>()
            .map_err(|_| ParamError::Address(s.to_string()))?;
        Cidr::new(ip, prefix_len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

/// Opaque credential string. Never interpreted here, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Credential(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential([redacted])")
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Credential::new(value)
    }
}

/// Everything needed to establish one tunnel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub endpoint: Endpoint,
    /// Local tunnel address.
    pub address: Cidr,
    pub private_credential: Credential,
    pub public_credential: Credential,
    /// Prefixes routed through the tunnel. Empty means the default route.
    pub routed_prefixes: Vec<Cidr>,
}

impl ConnectionParameters {
    pub fn new(
        endpoint: Endpoint,
        address: Cidr,
        private_credential: Credential,
        public_credential: Credential,
    ) -> Self {
        Self {
            endpoint,
            address,
            private_credential,
            public_credential,
            routed_prefixes: Vec::new(),
        }
    }

    /// Check everything a connect request needs to be acted on.
    pub fn validate(&self) -> Result<(), ParamError> {
        self.address.check()?;
        for prefix in &self.routed_prefixes {
            prefix.check()?;
        }
        if self.private_credential.is_empty() {
            return Err(ParamError::EmptyCredential("private"));
        }
        if self.public_credential.is_empty() {
            return Err(ParamError::EmptyCredential("public"));
        }
        Ok(())
    }

    /// Routed prefixes with the empty-set default applied.
    pub fn effective_routes(&self) -> Vec<Cidr> {
        if self.routed_prefixes.is_empty() {
            vec![Cidr::default_route()]
        } else {
            self.routed_prefixes.clone()
        }
    }

    /// Interface configuration for the pipe provider.
    pub fn interface_config(&self, mtu: u16) -> InterfaceConfig {
        InterfaceConfig {
            address: self.address.ip,
            prefix_len: self.address.prefix_len,
            routes: self
                .effective_routes()
                .iter()
                .map(|cidr| (cidr.ip, cidr.prefix_len))
                .collect(),
            mtu,
        }
    }
}
