//! # burrow-tunnel
//!
//! The tunnel side of burrow: reads raw IPv4 datagrams from a per-process
//! virtual interface, synthesizes the server half of every TCP connection
//! locally, and relays payload streams to the relay host over a single
//! persistent websocket channel.
//!
//! ## Architecture
//!
//! ```text
//! client app
//!     ↕ virtual interface (external collaborator provides the fd)
//! TunnelEndpoint reader task
//!     ↕ TcpSegment parse / build (burrow-net)
//! TcpSynthesizer + FlowTable
//!     ↕ Request / Response frames (burrow-proto)
//! RelayChannel (websocket, protected socket)
//!     ↕ network
//! relay host (burrow-relay)
//! ```
//!
//! The synthesizer is a deliberately partial TCP implementation with a
//! fixed ISN and a fixed advertised window. It exists so the client
//! application sees a fully functional peer while the actual byte
//! streams ride the relay channel.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod channel;
pub mod endpoint;
mod error;
pub mod flow;
pub mod iface;
pub mod synth;

pub use channel::{RelayChannel, RelayLink};
pub use endpoint::{TunnelConfig, TunnelEndpoint, TunnelState};
pub use error::{ChannelError, TunnelError};
pub use iface::{FdInterface, MemoryInterface, NoopProtector, SocketProtector, VirtualInterface};
pub use synth::TcpSynthesizer;
