//! Wire framing: a 4-byte big-endian length word (which counts itself),
//! a fixed six-word header, then the procedure-specific payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::xdr::XdrEncode;

/// Size of the length word.
pub const LEN_WORD: usize = 4;
/// Size of the fixed message header (six big-endian u32 fields).
pub const HEADER_LEN: usize = 24;
/// Upper bound on everything after the length word.
pub const MESSAGE_MAX: usize = 262144;
/// Largest well-formed frame, length word included.
pub const FRAME_MAX: usize = LEN_WORD + MESSAGE_MAX;
/// Smallest well-formed frame: length word plus bare header.
pub const FRAME_MIN: usize = LEN_WORD + HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Client request expecting a reply.
    Call = 0,
    /// Server reply to a call, correlated by serial.
    Reply = 1,
    /// Server-initiated event, not tied to any caller.
    Message = 2,
    /// Data stream packet, correlated by (procedure, serial).
    Stream = 3,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Reply),
            2 => Ok(MessageType::Message),
            3 => Ok(MessageType::Stream),
            _ => Err(Error::Protocol(format!("unknown message type {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageStatus {
    Ok = 0,
    Error = 1,
    /// More stream data follows.
    Continue = 2,
}

impl MessageStatus {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MessageStatus::Ok),
            1 => Ok(MessageStatus::Error),
            2 => Ok(MessageStatus::Continue),
            _ => Err(Error::Protocol(format!("unknown status {value}"))),
        }
    }
}

/// The fixed-layout header present in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub mtype: MessageType,
    pub serial: u32,
    pub status: MessageStatus,
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.program);
        buf.put_u32(self.version);
        buf.put_u32(self.procedure);
        buf.put_u32(self.mtype as u32);
        buf.put_u32(self.serial);
        buf.put_u32(self.status as u32);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::PacketTooSmall {
                len: buf.remaining() + LEN_WORD,
            });
        }
        Ok(Header {
            program: buf.get_u32(),
            version: buf.get_u32(),
            procedure: buf.get_u32(),
            mtype: MessageType::from_u32(buf.get_u32())?,
            serial: buf.get_u32(),
            status: MessageStatus::from_u32(buf.get_u32())?,
        })
    }
}

/// Builds a complete frame: length placeholder, header, payload, then the
/// length word backfilled. Fails with `PacketTooLarge` when the payload
/// pushes the frame past `FRAME_MAX`.
pub fn encode_frame<P: XdrEncode>(header: &Header, payload: &P) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(FRAME_MIN + 64);
    buf.put_u32(0);
    header.encode(&mut buf);
    payload.encode(&mut buf);
    finish_frame(buf)
}

/// Same as [`encode_frame`] but with a raw byte payload, used for stream
/// data packets where the body is opaque and unpadded.
pub fn encode_raw_frame(header: &Header, payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(FRAME_MIN + payload.len());
    buf.put_u32(0);
    header.encode(&mut buf);
    buf.put_slice(payload);
    finish_frame(buf)
}

fn finish_frame(mut buf: BytesMut) -> Result<Bytes> {
    let len = buf.len();
    if len > FRAME_MAX {
        return Err(Error::PacketTooLarge {
            len,
            max: FRAME_MAX,
        });
    }
    buf[..4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(buf.freeze())
}

/// Reads the declared frame length without consuming anything. `Ok(None)`
/// when fewer than four bytes are buffered; bounds violations surface
/// before any of the frame is consumed.
pub fn peek_frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < LEN_WORD {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < FRAME_MIN {
        return Err(Error::PacketTooSmall { len });
    }
    if len > FRAME_MAX {
        return Err(Error::PacketTooLarge {
            len,
            max: FRAME_MAX,
        });
    }
    Ok(Some(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto;

    fn header(serial: u32) -> Header {
        Header {
            program: proto::PROGRAM,
            version: proto::PROTOCOL_VERSION,
            procedure: proto::PROC_GET_VERSION,
            mtype: MessageType::Call,
            serial,
            status: MessageStatus::Ok,
        }
    }

    #[test]
    fn empty_payload_frame_is_28_bytes() {
        let frame = encode_frame(&header(1), &()).unwrap();
        assert_eq!(frame.len(), 28);
        assert_eq!(&frame[..4], &[0, 0, 0, 28]);
    }

    #[test]
    fn header_roundtrip() {
        let hdr = Header {
            program: proto::PROGRAM,
            version: proto::PROTOCOL_VERSION,
            procedure: 42,
            mtype: MessageType::Stream,
            serial: 9,
            status: MessageStatus::Continue,
        };
        let frame = encode_raw_frame(&hdr, b"abcd").unwrap();
        assert_eq!(frame.len(), 32);

        let mut body = frame.slice(LEN_WORD..);
        let decoded = Header::decode(&mut body).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(&body[..], b"abcd");
    }

    #[test]
    fn oversized_payload_rejected() {
        let big = vec![0u8; MESSAGE_MAX];
        let err = encode_raw_frame(&header(1), &big).unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge { .. }));
    }

    #[test]
    fn declared_length_bounds() {
        // Too small to hold a header.
        let err = peek_frame_len(&8u32.to_be_bytes()).unwrap_err();
        assert!(matches!(err, Error::PacketTooSmall { len: 8 }));

        // The oversized-frame attack: length word of 0xFFFFFFFF.
        let err = peek_frame_len(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge { .. }));

        // Partial length word: need more data.
        assert!(peek_frame_len(&[0, 0]).unwrap().is_none());

        assert_eq!(peek_frame_len(&28u32.to_be_bytes()).unwrap(), Some(28));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = BytesMut::new();
        header(1).encode(&mut buf);
        buf[12..16].copy_from_slice(&7u32.to_be_bytes());
        let mut body = buf.freeze();
        assert!(matches!(
            Header::decode(&mut body),
            Err(Error::Protocol(_))
        ));
    }
}
