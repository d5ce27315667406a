//! veil-session - Connection lifecycle for the veil VPN client
//!
//! Everything between "the user pressed connect" and packets flowing:
//! the session state machine, reconnection with exponential backoff,
//! preference persistence and the kill-switch condition.
//!
//! # Architecture
//!
//! ```text
//!   connect / disconnect          network events        retry timers
//!   (user commands)               (NetworkMonitor)      (single-shot)
//!          │                            │                    │
//!          └──────────────┬─────────────┴────────────────────┘
//!                         ▼
//!               ┌──────────────────┐ owns  ┌──────────────────┐
//!               │  SessionWorker   │──────▶│ state, intent,   │
//!               │  (one task, all  │       │ retry budget,    │
//!               │  messages serial)│       │ live tunnel      │
//!               └────────┬─────────┘       └──────────────────┘
//!                        │ publishes
//!                        ▼
//!               ┌──────────────────┐
//!               │  status watch    │──▶ snapshots for UIs/loggers
//!               └──────────────────┘
//! ```
//!
//! # Features
//!
//! - **Serialized state machine**: commands, timer expiries and network
//!   events are processed one at a time; no transition races
//! - **Bounded reconnection**: delay doubles from 2s to a 30s cap, five
//!   attempts per outage, then the session parks in the error state
//! - **Crash-safe intent**: the stay-connected flag is persisted so a
//!   restart can restore the previous session
//! - **Consistent status**: state and traffic counters are published
//!   together and never mix tunnel generations

mod backend;
mod event;
mod keys;
mod kill_switch;
mod manager;
mod params;
mod policy;
mod state;
mod store;

pub use backend::TunnelBackend;
pub use event::{ManualMonitor, NetworkEvent, NetworkMonitor};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use kill_switch::{KillSwitch, KillSwitchState};
pub use manager::{
    ConnectError, SessionBuilder, SessionConfig, SessionManager, StatusWatch,
};
pub use params::{Cidr, ConnectionParameters, Credential, Endpoint, ParamError};
pub use policy::{Decision, ReconnectConfig, ReconnectPolicy, RetryState};
pub use state::{ConnectionState, StatusSnapshot};
pub use store::{JsonFileStore, MemoryStore, PreferenceStore, Preferences, StoreError};
