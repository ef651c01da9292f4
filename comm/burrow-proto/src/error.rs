//! Error types for frame decoding.

use thiserror::Error;

/// Errors produced while decoding a relay channel frame.
///
/// Encoding never fails; every variant here is a decode-side rejection.
/// A malformed frame is logged and dropped by both sides; it never tears
/// down the channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ended before a declared length was satisfied.
    #[error("malformed frame: truncated while reading {0}")]
    Truncated(&'static str),

    /// The leading type tag is not a known request or response tag.
    #[error("malformed frame: unknown type tag {0:#04x}")]
    UnknownTag(u8),

    /// A length-prefixed string field is not valid UTF-8.
    #[error("malformed frame: {0} is not valid UTF-8")]
    InvalidString(&'static str),

    /// The destination address of a `Connect` is not a dotted-quad IPv4
    /// address.
    #[error("malformed frame: invalid destination address {0:?}")]
    InvalidAddress(String),

    /// Bytes remained after the declared end of the frame.
    #[error("malformed frame: {0} trailing bytes")]
    TrailingBytes(usize),
}
