//! IPv4/TCP segment parsing and construction.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use burrow_constants::net::{IPV4_HEADER_LEN, TCP_HEADER_LEN, TTL};

use crate::checksum::{checksum, tcp_checksum};

/// TCP FIN flag.
pub const TCP_FIN: u8 = 0x01;
/// TCP SYN flag.
pub const TCP_SYN: u8 = 0x02;
/// TCP RST flag.
pub const TCP_RST: u8 = 0x04;
/// TCP PSH flag.
pub const TCP_PSH: u8 = 0x08;
/// TCP ACK flag.
pub const TCP_ACK: u8 = 0x10;

/// Process-wide IPv4 identification counter, shared by all flows.
static IDENT: AtomicU16 = AtomicU16::new(0);

/// Returns the next IPv4 identification value.
#[must_use]
pub fn next_ident() -> u16 {
    IDENT.fetch_add(1, Ordering::Relaxed)
}

/// A parsed inbound TCP segment.
///
/// The payload borrows from the datagram buffer it was parsed out of; no
/// copies are made on the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number (meaningful only when the ACK flag is set).
    pub ack: u32,
    /// Raw TCP flag bits (low byte of the flags field).
    pub flags: u8,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Parses one IPv4 datagram into a TCP segment.
    ///
    /// Returns `None` for anything that is not a well-formed IPv4/TCP
    /// datagram: too short for an IPv4 header, wrong IP version, non-TCP
    /// protocol, or a data offset pointing past the end. Such datagrams
    /// are silently dropped by the caller.
    #[must_use]
    pub fn parse(datagram: &'a [u8]) -> Option<Self> {
        if datagram.len() < IPV4_HEADER_LEN {
            return None;
        }
        if datagram[0] >> 4 != 4 {
            return None;
        }
        if datagram[9] != 6 {
            return None;
        }

        let ihl = usize::from(datagram[0] & 0x0F) * 4;
        let total_len = usize::from(u16::from_be_bytes([datagram[2], datagram[3]]));
        // The read buffer may be larger than the datagram; the IP total
        // length field delimits it.
        let end = total_len.min(datagram.len());
        if ihl < IPV4_HEADER_LEN || end < ihl + TCP_HEADER_LEN {
            return None;
        }

        let src_ip = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
        let dst_ip = Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]);

        let tcp = &datagram[ihl..end];
        let data_offset = usize::from(tcp[12] >> 4) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > tcp.len() {
            return None;
        }

        Some(Self {
            src_ip,
            dst_ip,
            src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
            dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
            seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
            ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
            flags: tcp[13],
            payload: &tcp[data_offset..],
        })
    }

    /// True for a connection-opening SYN (SYN set, ACK clear).
    #[must_use]
    pub const fn is_pure_syn(&self) -> bool {
        self.flags & TCP_SYN != 0 && self.flags & TCP_ACK == 0
    }

    /// True when the FIN flag is set.
    #[must_use]
    pub const fn has_fin(&self) -> bool {
        self.flags & TCP_FIN != 0
    }
}

/// Builds a complete IPv4 datagram carrying one TCP segment.
///
/// Fixed 20-byte IPv4 header (DF set, TTL 64, identification from the
/// process-wide counter) followed by a fixed 20-byte TCP header (data
/// offset 5, no options) and the payload. Both checksums are filled.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_len = TCP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + tcp_len;
    let mut datagram = vec![0u8; total_len];

    // -- IPv4 header (20 bytes, no options) --
    datagram[0] = 0x45; // Version 4, IHL 5
    datagram[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    datagram[4..6].copy_from_slice(&next_ident().to_be_bytes());
    datagram[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // Don't Fragment
    datagram[8] = TTL;
    datagram[9] = 6; // Protocol: TCP
    datagram[12..16].copy_from_slice(&src_ip.octets());
    datagram[16..20].copy_from_slice(&dst_ip.octets());

    let ip_cksum = checksum(&datagram[..IPV4_HEADER_LEN]);
    datagram[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    // -- TCP header (20 bytes) --
    let tcp = &mut datagram[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    // Data offset (5 words = 20 bytes) in the upper 4 bits.
    tcp[12] = 0x50;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&window.to_be_bytes());
    // Checksum and urgent pointer stay 0 until computed.

    if !payload.is_empty() {
        tcp[TCP_HEADER_LEN..].copy_from_slice(payload);
    }

    let tcp_cksum = tcp_checksum(src_ip, dst_ip, &datagram[IPV4_HEADER_LEN..]);
    datagram[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18]
        .copy_from_slice(&tcp_cksum.to_be_bytes());

    datagram
}
