//! veil-tun - Tunnel interface layer
//!
//! Owns everything that touches the virtual network interface: acquiring
//! and releasing the packet pipe, the exclusive [`TunnelHandle`], per-handle
//! [`TrafficCounters`], and the [`ForwardingLoop`] that shuttles packets
//! between the pipe and the remote transport.
//!
//! # Architecture
//!
//! ```text
//!   host networking stack
//!            │
//!            ▼
//!   ┌─────────────────┐   recv / send   ┌─────────────────┐
//!   │   PacketPipe    │◀───────────────▶│  TunnelHandle   │
//!   │ (tun device or  │                 │  + counters     │
//!   │  in-memory pair)│                 └────────┬────────┘
//!   └─────────────────┘                          │
//!                                        ForwardingLoop
//!                                                │
//!                                       ┌────────▼────────┐
//!                                       │ TunnelTransport │
//!                                       │ (remote tunnel) │
//!                                       └─────────────────┘
//! ```
//!
//! The pipe is a capability supplied by the host through [`PipeProvider`];
//! channel-backed implementations ([`MemoryPipe`], [`MemoryTransport`]) are
//! included for tests and loopback setups.

mod counters;
mod forward;
mod handle;
mod interface;
mod memory;
mod pipe;
mod transport;

pub use counters::TrafficCounters;
pub use forward::{ForwardingLoop, LoopFailure, READ_BUFFER_SIZE};
pub use handle::{HandleError, TunnelHandle};
pub use interface::TunnelInterface;
pub use memory::{MemoryPipe, MemoryPipeRemote};
pub use pipe::{DEFAULT_MTU, EstablishError, InterfaceConfig, PacketPipe, PipeProvider};
pub use transport::{MemoryTransport, MemoryTransportRemote, TunnelTransport};
