//! Request and response frames and their binary codec.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

const TAG_CONNECT: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_DISCONNECT: u8 = 0x03;
const TAG_SHUTDOWN_WRITE: u8 = 0x04;

const TAG_CONNECTED: u8 = 0x01;
const TAG_DISCONNECTED: u8 = 0x03;
const TAG_ERROR: u8 = 0x04;

/// A frame sent by the tunnel endpoint to the relay host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open a real TCP connection to `dest_ip:dest_port` on behalf of the
    /// flow identified by `id`.
    Connect {
        id: String,
        dest_ip: Ipv4Addr,
        dest_port: u16,
    },
    /// Forward client payload bytes to the real socket.
    Data { id: String, payload: Bytes },
    /// Drop the connection record and destroy the real socket.
    Disconnect { id: String },
    /// Half-close the write side of the real socket; the server may still
    /// send.
    ShutdownWrite { id: String },
}

/// A frame sent by the relay host to the tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The real connection for `id` is established.
    Connected { id: String },
    /// Bytes read from the real socket, possibly coalesced.
    Data { id: String, payload: Bytes },
    /// The real socket closed cleanly.
    Disconnected { id: String },
    /// The connection failed or hit an error; `message` is human-readable.
    Error { id: String, message: String },
}

impl Request {
    /// Returns the connection id the frame refers to.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Connect { id, .. }
            | Self::Data { id, .. }
            | Self::Disconnect { id }
            | Self::ShutdownWrite { id } => id,
        }
    }

    /// Encodes the frame into a single wire message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Connect {
                id,
                dest_ip,
                dest_port,
            } => {
                let ip = dest_ip.to_string();
                let mut buf = BytesMut::with_capacity(1 + 2 + id.len() + 2 + ip.len() + 2);
                buf.put_u8(TAG_CONNECT);
                put_string16(&mut buf, id);
                put_string16(&mut buf, &ip);
                buf.put_u16(*dest_port);
                buf.freeze()
            }
            Self::Data { id, payload } => {
                let mut buf = BytesMut::with_capacity(1 + 2 + id.len() + 4 + payload.len());
                buf.put_u8(TAG_DATA);
                put_string16(&mut buf, id);
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(payload);
                buf.freeze()
            }
            Self::Disconnect { id } => encode_bare(TAG_DISCONNECT, id),
            Self::ShutdownWrite { id } => encode_bare(TAG_SHUTDOWN_WRITE, id),
        }
    }

    /// Decodes one wire message into a frame.
    pub fn decode(mut data: Bytes) -> Result<Self, FrameError> {
        let buf = &mut data;
        let tag = get_u8(buf, "request tag")?;
        let id = get_string16(buf, "connection id")?;

        let frame = match tag {
            TAG_CONNECT => {
                let addr = get_string16(buf, "destination address")?;
                let dest_ip: Ipv4Addr = addr
                    .parse()
                    .map_err(|_| FrameError::InvalidAddress(addr))?;
                let dest_port = get_u16(buf, "destination port")?;
                Self::Connect {
                    id,
                    dest_ip,
                    dest_port,
                }
            }
            TAG_DATA => Self::Data {
                id,
                payload: get_payload32(buf)?,
            },
            TAG_DISCONNECT => Self::Disconnect { id },
            TAG_SHUTDOWN_WRITE => Self::ShutdownWrite { id },
            other => return Err(FrameError::UnknownTag(other)),
        };

        if buf.has_remaining() {
            return Err(FrameError::TrailingBytes(buf.remaining()));
        }
        Ok(frame)
    }
}

impl Response {
    /// Returns the connection id the frame refers to.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Connected { id }
            | Self::Data { id, .. }
            | Self::Disconnected { id }
            | Self::Error { id, .. } => id,
        }
    }

    /// Encodes the frame into a single wire message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Connected { id } => encode_bare(TAG_CONNECTED, id),
            Self::Data { id, payload } => {
                let mut buf = BytesMut::with_capacity(1 + 2 + id.len() + 4 + payload.len());
                buf.put_u8(TAG_DATA);
                put_string16(&mut buf, id);
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(payload);
                buf.freeze()
            }
            Self::Disconnected { id } => encode_bare(TAG_DISCONNECTED, id),
            Self::Error { id, message } => {
                let mut buf = BytesMut::with_capacity(1 + 2 + id.len() + 2 + message.len());
                buf.put_u8(TAG_ERROR);
                put_string16(&mut buf, id);
                put_string16(&mut buf, message);
                buf.freeze()
            }
        }
    }

    /// Decodes one wire message into a frame.
    pub fn decode(mut data: Bytes) -> Result<Self, FrameError> {
        let buf = &mut data;
        let tag = get_u8(buf, "response tag")?;
        let id = get_string16(buf, "connection id")?;

        let frame = match tag {
            TAG_CONNECTED => Self::Connected { id },
            TAG_DATA => Self::Data {
                id,
                payload: get_payload32(buf)?,
            },
            TAG_DISCONNECTED => Self::Disconnected { id },
            TAG_ERROR => Self::Error {
                id,
                message: get_string16(buf, "error message")?,
            },
            other => return Err(FrameError::UnknownTag(other)),
        };

        if buf.has_remaining() {
            return Err(FrameError::TrailingBytes(buf.remaining()));
        }
        Ok(frame)
    }
}

fn encode_bare(tag: u8, id: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 2 + id.len());
    buf.put_u8(tag);
    put_string16(&mut buf, id);
    buf.freeze()
}

fn put_string16(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, FrameError> {
    if buf.remaining() < 1 {
        return Err(FrameError::Truncated(field));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes, field: &'static str) -> Result<u16, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Truncated(field));
    }
    Ok(buf.get_u16())
}

fn get_string16(buf: &mut Bytes, field: &'static str) -> Result<String, FrameError> {
    let len = get_u16(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated(field));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidString(field))
}

fn get_payload32(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::Truncated("payload length"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated("payload"));
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(frame: &Request) {
        let decoded = Request::decode(frame.encode()).expect("decode");
        assert_eq!(&decoded, frame);
    }

    fn roundtrip_response(frame: &Response) {
        let decoded = Response::decode(frame.encode()).expect("decode");
        assert_eq!(&decoded, frame);
    }

    #[test]
    fn request_roundtrips() {
        roundtrip_request(&Request::Connect {
            id: "10.0.0.2:49152->93.184.216.34:443".to_string(),
            dest_ip: Ipv4Addr::new(93, 184, 216, 34),
            dest_port: 443,
        });
        roundtrip_request(&Request::Data {
            id: "a".to_string(),
            payload: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
        });
        roundtrip_request(&Request::Disconnect { id: String::new() });
        roundtrip_request(&Request::ShutdownWrite {
            id: "x".repeat(300),
        });
    }

    #[test]
    fn response_roundtrips() {
        roundtrip_response(&Response::Connected {
            id: "conn".to_string(),
        });
        roundtrip_response(&Response::Data {
            id: "conn".to_string(),
            payload: Bytes::from(vec![0xAB; 1 << 20]),
        });
        roundtrip_response(&Response::Data {
            id: "conn".to_string(),
            payload: Bytes::new(),
        });
        roundtrip_response(&Response::Disconnected {
            id: "conn".to_string(),
        });
        roundtrip_response(&Response::Error {
            id: "conn".to_string(),
            message: "connect timeout".to_string(),
        });
    }

    #[test]
    fn connect_wire_layout() {
        let frame = Request::Connect {
            id: "ab".to_string(),
            dest_ip: Ipv4Addr::new(1, 2, 3, 4),
            dest_port: 443,
        };
        let wire = frame.encode();
        assert_eq!(wire[0], 0x01);
        assert_eq!(&wire[1..3], &[0, 2]); // id_len
        assert_eq!(&wire[3..5], b"ab");
        assert_eq!(&wire[5..7], &[0, 7]); // ip_len
        assert_eq!(&wire[7..14], b"1.2.3.4");
        assert_eq!(&wire[14..16], &[0x01, 0xBB]); // 443
        assert_eq!(wire.len(), 16);
    }

    #[test]
    fn data_wire_layout_is_big_endian() {
        let frame = Response::Data {
            id: "c".to_string(),
            payload: Bytes::from_static(&[0xDE, 0xAD]),
        };
        let wire = frame.encode();
        assert_eq!(wire[0], 0x02);
        assert_eq!(&wire[1..3], &[0, 1]);
        assert_eq!(wire[3], b'c');
        assert_eq!(&wire[4..8], &[0, 0, 0, 2]); // payload_len as u32
        assert_eq!(&wire[8..], &[0xDE, 0xAD]);
    }

    #[test]
    fn truncated_frames_rejected() {
        let frame = Request::Connect {
            id: "conn".to_string(),
            dest_ip: Ipv4Addr::new(9, 9, 9, 9),
            dest_port: 1,
        };
        let wire = frame.encode();
        for cut in 0..wire.len() {
            let err = Request::decode(wire.slice(..cut)).expect_err("short frame must fail");
            assert!(matches!(err, FrameError::Truncated(_)), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x7F);
        wire.put_u16(0);
        assert_eq!(
            Request::decode(wire.freeze()),
            Err(FrameError::UnknownTag(0x7F))
        );
    }

    #[test]
    fn declared_length_beyond_buffer_rejected() {
        // Disconnect claiming a 100-byte id with only 3 present.
        let mut wire = BytesMut::new();
        wire.put_u8(0x03);
        wire.put_u16(100);
        wire.extend_from_slice(b"abc");
        assert!(matches!(
            Request::decode(wire.freeze()),
            Err(FrameError::Truncated(_))
        ));
    }

    #[test]
    fn invalid_utf8_id_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x03);
        wire.put_u16(2);
        wire.extend_from_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            Response::decode(wire.freeze()),
            Err(FrameError::InvalidString(_))
        ));
    }

    #[test]
    fn bad_dotted_quad_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x01);
        wire.put_u16(1);
        wire.extend_from_slice(b"i");
        wire.put_u16(9);
        wire.extend_from_slice(b"not-an-ip");
        wire.put_u16(80);
        assert!(matches!(
            Request::decode(wire.freeze()),
            Err(FrameError::InvalidAddress(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut wire = BytesMut::from(&Request::Disconnect { id: "c".into() }.encode()[..]);
        wire.put_u8(0);
        assert_eq!(
            Request::decode(wire.freeze()),
            Err(FrameError::TrailingBytes(1))
        );
    }

    #[test]
    fn request_and_response_data_share_the_wire_shape() {
        // The two 0x02 tags are distinct types but identical layouts; a
        // frame encoded as one decodes as the other.
        let req = Request::Data {
            id: "c".to_string(),
            payload: Bytes::from_static(b"hello"),
        };
        let resp = Response::decode(req.encode()).expect("decode as response");
        assert_eq!(
            resp,
            Response::Data {
                id: "c".to_string(),
                payload: Bytes::from_static(b"hello"),
            }
        );
    }
}
