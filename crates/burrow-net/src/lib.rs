//! # burrow-net
//!
//! IPv4/TCP wire codec for the tunnel endpoint's TCP synthesizer.
//!
//! The tunnel never hands packets to a kernel stack: every segment the
//! client application sees is parsed and rebuilt here, byte by byte.
//! This crate provides the two halves of that:
//!
//! - [`TcpSegment::parse`]: gate and decode an inbound IPv4/TCP datagram
//!   read from the virtual interface.
//! - [`build_tcp_segment`]: construct a complete outbound datagram
//!   (fixed 20-byte IPv4 header, fixed 20-byte TCP header, no options)
//!   with both checksums filled.
//!
//! All multi-byte integers are big-endian; sequence arithmetic is
//! unsigned 32-bit modular and stays 32-bit.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod checksum;
mod packet;

pub use packet::{
    build_tcp_segment, next_ident, TcpSegment, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN,
};
