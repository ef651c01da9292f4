//! Constants for the synthesized IPv4/TCP wire format.

use core::net::Ipv4Addr;

/// The tunnel endpoint's own address on the virtual interface.
pub const TUNNEL_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Prefix length of the virtual interface subnet.
pub const TUNNEL_PREFIX_LEN: u8 = 24;

/// MTU of the virtual interface.
pub const MTU: usize = 1500;

/// Fixed IPv4 header size (no options are ever emitted).
pub const IPV4_HEADER_LEN: usize = 20;

/// Fixed TCP header size (no options are ever emitted).
pub const TCP_HEADER_LEN: usize = 20;

/// Largest TCP payload per synthesized segment: MTU minus the two fixed
/// headers.
pub const MAX_SEGMENT_PAYLOAD: usize = MTU - IPV4_HEADER_LEN - TCP_HEADER_LEN;

/// Receive window advertised in every synthesized segment. Never updated.
pub const ADVERTISED_WINDOW: u16 = 65535;

/// TTL of every synthesized datagram.
pub const TTL: u8 = 64;

/// ISN of the synthesized server side. The SYN-ACK carries this sequence
/// number.
pub const SYNTH_ISN: u32 = 1;

/// First data sequence number on the synthesized side: the SYN at
/// [`SYNTH_ISN`] consumes one sequence number.
pub const SYNTH_FIRST_DATA_SEQ: u32 = 2;

/// Read buffer size for one virtual-interface datagram.
pub const IFACE_READ_BUF: usize = 32 * 1024;
