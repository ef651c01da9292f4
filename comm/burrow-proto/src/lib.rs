//! # burrow-proto
//!
//! Frame protocol carried on the relay channel between the tunnel endpoint
//! and the relay host. Every websocket message is exactly one encoded frame.
//!
//! Two disjoint message classes flow in opposite directions:
//!
//! - [`Request`] (tunnel → host): `Connect`, `Data`, `Disconnect`,
//!   `ShutdownWrite`.
//! - [`Response`] (host → tunnel): `Connected`, `Data`, `Disconnected`,
//!   `Error`.
//!
//! ## Wire format
//!
//! Big-endian throughout. Each frame starts with a one-byte type tag,
//! followed by a length-prefixed UTF-8 connection id (`u16` count), then
//! variant-specific fields:
//!
//! ```text
//! Connect       tag 0x01 | u16 id_len | id | u16 ip_len | ip | u16 port
//! Data          tag 0x02 | u16 id_len | id | u32 len    | payload
//! Disconnect    tag 0x03 | u16 id_len | id
//! ShutdownWrite tag 0x04 | u16 id_len | id
//! ```
//!
//! Responses use the same layout with their own tag space; `Error` carries
//! a `u16`-prefixed UTF-8 message instead of a payload.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod error;
mod frame;

pub use error::FrameError;
pub use frame::{Request, Response};
