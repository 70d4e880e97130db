//! The 8-byte frame header: total length, two reserved bytes, type id, flags.

use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, Result};
use crate::messages::MessageType;

/// Size of the encoded header.
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the whole frame, header included.
    pub length: u32,
    pub message_type: MessageType,
    pub flags: u8,
}

impl Header {
    /// Header for a payload of `payload_len` bytes.
    pub fn new(message_type: MessageType, payload_len: usize, flags: u8) -> Result<Self> {
        let length = payload_len
            .checked_add(HEADER_LEN)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "length",
                value: payload_len.to_string(),
                reason: "frame does not fit a 32-bit length",
            })?;
        Ok(Self {
            length,
            message_type,
            flags,
        })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u32(self.length);
        buf.put_bytes(0, 2);
        buf.put_u8(self.message_type.id());
        buf.put_u8(self.flags);
        out
    }

    /// Decode and validate a header.
    ///
    /// `max_length` caps the declared frame length so oversized frames are
    /// refused before their payload is allocated.
    pub fn decode(bytes: &[u8], max_length: u32) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::EndOfStream);
        }
        let mut buf = &bytes[..HEADER_LEN];
        let length = buf.get_u32();
        buf.advance(2);
        let type_id = buf.get_u8();
        let flags = buf.get_u8();

        if (length as usize) < HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "frame length {length} is shorter than the header"
            )));
        }
        if length > max_length {
            return Err(ProtocolError::OversizeFrame {
                length,
                max: max_length,
            });
        }
        let message_type =
            MessageType::from_id(type_id).ok_or(ProtocolError::UnknownMessageType(type_id))?;

        Ok(Self {
            length,
            message_type,
            flags,
        })
    }
}
