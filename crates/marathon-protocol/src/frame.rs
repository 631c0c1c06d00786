//! The fixed 16-byte frame header that precedes every payload, and helpers
//! for moving whole frames over a stream.
//!
//! ```text
//! offset size field
//! 0      4    magic = 'M','R','T','N'
//! 4      1    version = 1
//! 5      1    msg_type
//! 6      1    flags
//! 7      1    reserved = 0
//! 8      4    payload_len  (big-endian u32)
//! 12     4    request_id   (big-endian u32)
//! 16     N    payload bytes
//! ```
//!
//! Senders put the header and payload on the wire as one write; receivers
//! tolerate arbitrarily fragmented reads.

use std::io::{Read, Write};

use Error::{IncompletePayload, InvalidMagic, MessageTooShort, UnsupportedVersion};

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::msg_type::MsgType;
use crate::wire::{FromWire, ToWire};

/// Frame magic, 'MRTN' in ASCII.
pub const MAGIC: [u8; 4] = *b"MRTN";

/// The only protocol version currently spoken.
pub const VERSION: u8 = 1;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 16;

/// This frame is one element of a streaming response.
pub const FLAG_STREAMING: u8 = 0b0000_0001;

/// Reserved, never set.
pub const FLAG_COMPRESSED: u8 = 0b0000_0010;

/// Reserved, never set.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0100;

/// Largest payload a peer may declare. Anything bigger is treated as a
/// protocol error before any allocation happens.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MsgType,
    pub flags: u8,
    pub payload_len: u32,
    pub request_id: u32,
}

impl FrameHeader {
    pub fn new(msg_type: MsgType, payload_len: u32, request_id: u32) -> Self {
        Self {
            msg_type,
            flags: 0,
            payload_len,
            request_id,
        }
    }

    pub fn streaming(msg_type: MsgType, payload_len: u32, request_id: u32) -> Self {
        Self {
            msg_type,
            flags: FLAG_STREAMING,
            payload_len,
            request_id,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.flags & FLAG_STREAMING != 0
    }
}

impl ToWire for FrameHeader {
    fn wire_size(&self) -> usize {
        HEADER_SIZE
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_fixed(&MAGIC)?;
        cursor.try_put_u8(VERSION)?;
        cursor.try_put_u8(self.msg_type as u8)?;
        cursor.try_put_u8(self.flags)?;
        cursor.try_put_u8(0)?;
        cursor.try_put_u32(self.payload_len)?;
        cursor.try_put_u32(self.request_id)
    }
}

impl FromWire for FrameHeader {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        if cursor.remaining() < HEADER_SIZE {
            return Err(MessageTooShort(HEADER_SIZE, cursor.remaining()));
        }

        let magic: [u8; 4] = cursor.get_fixed();
        if magic != MAGIC {
            return Err(InvalidMagic(u32::from_be_bytes(magic)));
        }

        let version = cursor.get_u8();
        if version != VERSION {
            return Err(UnsupportedVersion(version));
        }

        let msg_type = MsgType::try_from(cursor.get_u8())?;
        let flags = cursor.get_u8();
        let _reserved = cursor.get_u8();
        let payload_len = cursor.get_u32();
        let request_id = cursor.get_u32();

        Ok(FrameHeader {
            msg_type,
            flags,
            payload_len,
            request_id,
        })
    }
}

/// A complete frame read off the wire: the parsed header and the raw payload
/// bytes, still encoded. The payload is decoded by the dispatch layer once it
/// has switched on `header.msg_type`.
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize `payload` behind a header and hand the result to `writer`
    /// as a single write.
    pub fn write_to<W: Write, T: ToWire>(
        writer: &mut W,
        msg_type: MsgType,
        flags: u8,
        request_id: u32,
        payload: &T,
    ) -> Result<(), Error> {
        let buf = encode(msg_type, flags, request_id, payload)?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one frame, tolerating fragmented delivery. A clean EOF before the
    /// first header byte returns `Ok(None)`; EOF anywhere else is an error.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Frame>, Error> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        let mut filled = 0;
        while filled < HEADER_SIZE {
            match reader.read(&mut header_bytes[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(MessageTooShort(HEADER_SIZE, filled)),
                n => filled += n,
            }
        }

        let mut cursor = ParseCursor::new(&mut header_bytes);
        let header = FrameHeader::from_wire(&mut cursor)?;

        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::LengthOverflow(
                header.payload_len as usize,
                MAX_PAYLOAD_LEN as usize,
            ));
        }

        let want = header.payload_len as usize;
        let mut payload = vec![0u8; want];

        let mut got = 0;
        while got < want {
            match reader.read(&mut payload[got..])? {
                0 => return Err(IncompletePayload(want, got)),
                n => got += n,
            }
        }

        Ok(Some(Frame { header, payload }))
    }
}

/// Serialize a header + payload into one contiguous buffer.
pub fn encode<T: ToWire>(
    msg_type: MsgType,
    flags: u8,
    request_id: u32,
    payload: &T,
) -> Result<Vec<u8>, Error> {
    let payload_len = payload.wire_size();
    let header = FrameHeader {
        msg_type,
        flags,
        payload_len: payload_len as u32,
        request_id,
    };

    let mut buf = vec![0u8; HEADER_SIZE + payload_len];
    let mut cursor = ParseCursor::new(&mut buf);
    header.to_wire(&mut cursor)?;
    payload.to_wire(&mut cursor)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_bit_exact() {
        let header = FrameHeader {
            msg_type: MsgType::SubmitTask,
            flags: FLAG_STREAMING,
            payload_len: 0x01020304,
            request_id: 0xa1b2c3d4,
        };

        let bytes = header.as_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], b"MRTN");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 0x01);
        assert_eq!(bytes[6], 0x01);
        assert_eq!(bytes[7], 0);
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[12..16], &[0xa1, 0xb2, 0xc3, 0xd4]);
    }

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(MsgType::HeartbeatRequest, 512, 7);
        let mut bytes = header.as_bytes().unwrap();

        let mut cursor = ParseCursor::new(&mut bytes);
        let decoded = FrameHeader::from_wire(&mut cursor).unwrap();
        assert_eq!(decoded, header);
        assert!(!decoded.is_streaming());
    }

    #[test]
    fn bad_magic_rejected() {
        let header = FrameHeader::new(MsgType::GetTask, 0, 1);
        let mut bytes = header.as_bytes().unwrap();
        bytes[0] = b'X';

        let mut cursor = ParseCursor::new(&mut bytes);
        match FrameHeader::from_wire(&mut cursor) {
            Err(InvalidMagic(_)) => (),
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn bad_version_rejected() {
        let header = FrameHeader::new(MsgType::GetTask, 0, 1);
        let mut bytes = header.as_bytes().unwrap();
        bytes[4] = 9;

        let mut cursor = ParseCursor::new(&mut bytes);
        match FrameHeader::from_wire(&mut cursor) {
            Err(UnsupportedVersion(9)) => (),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn short_header_rejected() {
        let mut bytes = [0u8; 7];
        bytes[0..4].copy_from_slice(b"MRTN");

        let mut cursor = ParseCursor::new(&mut bytes);
        match FrameHeader::from_wire(&mut cursor) {
            Err(MessageTooShort(16, 7)) => (),
            other => panic!("expected MessageTooShort, got {other:?}"),
        }
    }

    #[test]
    fn stream_round_trip_single_write() {
        let mut wire = Vec::new();
        Frame::write_to(&mut wire, MsgType::CancelTask, 0, 99, &0xfeedu16).unwrap();

        let mut reader = wire.as_slice();
        let frame = Frame::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MsgType::CancelTask);
        assert_eq!(frame.header.request_id, 99);
        assert_eq!(frame.payload, vec![0xfe, 0xed]);
    }

    #[test]
    fn fragmented_reads_are_tolerated() {
        struct OneByte<'a>(&'a [u8]);

        impl Read for OneByte<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }

        let mut wire = Vec::new();
        Frame::write_to(&mut wire, MsgType::GetUsage, 0, 3, &0xdeadbeefu32).unwrap();

        let frame = Frame::read_from(&mut OneByte(&wire)).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MsgType::GetUsage);
        assert_eq!(frame.payload, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn eof_before_header_is_none() {
        let mut empty: &[u8] = &[];
        assert!(Frame::read_from(&mut empty).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_incomplete() {
        let mut wire = Vec::new();
        Frame::write_to(&mut wire, MsgType::GetUsage, 0, 3, &0xdeadbeefu32).unwrap();
        wire.truncate(wire.len() - 2);

        let mut reader = wire.as_slice();
        match Frame::read_from(&mut reader) {
            Err(IncompletePayload(4, 2)) => (),
            other => panic!("expected IncompletePayload, got {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_len_rejected() {
        let header = FrameHeader::new(MsgType::GetTask, MAX_PAYLOAD_LEN + 1, 0);
        let bytes = header.as_bytes().unwrap();

        let mut reader = bytes.as_slice();
        assert!(matches!(
            Frame::read_from(&mut reader),
            Err(Error::LengthOverflow(_, _))
        ));
    }
}
