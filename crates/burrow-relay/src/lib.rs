//! # burrow-relay
//!
//! The relay host: accepts tunnel channels over websocket, owns the real
//! outbound TCP sockets, and streams server responses back as framed
//! `Data` messages.
//!
//! ## Architecture
//!
//! ```text
//! tunnel endpoint
//!     ↕ websocket (one frame per message)
//! RelayServer (axum: GET /health, GET /channel upgrade)
//!     ↕ one RelayManager event loop per channel
//! per-connection TcpStream + inbound batching (4096 B / 10 ms)
//!     ↕ network
//! destination servers
//! ```
//!
//! A channel serves exactly one tunnel; nothing survives a channel drop.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod error;
mod manager;
mod server;

pub use error::RelayError;
pub use server::{RelayConfig, RelayServer};
