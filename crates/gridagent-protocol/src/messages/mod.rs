//! The message catalogue.
//!
//! Type ids are positions in a fixed list shared with agent firmware; the
//! order below must never change. Downstream messages flow server to agent,
//! upstream messages agent to server.

mod downstream;
mod upstream;

pub use downstream::{
    CommandGaPollMeasurements, CommandGaPropagateTime, CommandGpSwitchControl,
    CommandGpSwitchRelay, ConfigGaPrices, ConfigGaRulesets, ConfigGaSoftware, ConfigGaTime,
    ConfigGp, ConfigGpSoftware,
};
pub use upstream::{
    AcknowledgementGaSoftware, AcknowledgementGpSoftware, BulkMeasurements, ErrorGaSoftware,
    ErrorGpSoftware, InfoAgentVersions, InfoEventLog, NotificationGaAddMode,
    NotificationGaConnectedSet, NotificationGaTime, NotificationGpState,
};

use bytes::BufMut;
use chrono::{DateTime, Utc};

use crate::error::{ProtocolError, Result};
use crate::header::{Header, HEADER_LEN};
use crate::reader::BufferReader;
use crate::types::{datetime_to_timestamp, Meter, SoftwareVersion};

/// Which way a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Server to agent.
    Downstream,
    /// Agent to server.
    Upstream,
}

/// Payload codec implemented by every catalogue entry.
pub trait WireMessage: Sized {
    /// Append the payload to `buf` and return the header flags.
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8>;

    /// Decode the payload. Trailing bytes are left in `read` for the caller
    /// to judge.
    fn unpack(header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self>;
}

macro_rules! catalogue {
    ($($id:literal => $name:ident: $direction:ident,)*) => {
        /// Catalogue entry, with the wire type id as discriminant.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($name = $id,)*
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[$(MessageType::$name,)*];

            pub fn from_id(id: u8) -> Option<Self> {
                match id {
                    $($id => Some(MessageType::$name),)*
                    _ => None,
                }
            }

            pub const fn id(self) -> u8 {
                self as u8
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(MessageType::$name => stringify!($name),)*
                }
            }

            pub const fn direction(self) -> Direction {
                match self {
                    $(MessageType::$name => Direction::$direction,)*
                }
            }
        }

        /// A decoded message of any catalogue type.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $($name($name),)*
        }

        $(
            impl From<$name> for Message {
                fn from(message: $name) -> Self {
                    Message::$name(message)
                }
            }
        )*

        impl Message {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $(Message::$name(_) => MessageType::$name,)*
                }
            }

            fn pack_payload(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
                match self {
                    $(Message::$name(message) => message.pack(buf, version),)*
                }
            }

            fn unpack_payload(
                header: &Header,
                read: &mut BufferReader<'_>,
                version: u32,
            ) -> Result<Self> {
                match header.message_type {
                    $(MessageType::$name => $name::unpack(header, read, version).map(Message::$name),)*
                }
            }
        }
    };
}

catalogue! {
    0 => BulkMeasurements: Upstream,
    1 => ConfigGp: Downstream,
    2 => ConfigGaRulesets: Downstream,
    3 => ConfigGaTime: Downstream,
    4 => ConfigGaPrices: Downstream,
    5 => ConfigGpSoftware: Downstream,
    6 => ConfigGaSoftware: Downstream,
    7 => CommandGaPollMeasurements: Downstream,
    8 => CommandGaPropagateTime: Downstream,
    9 => CommandGpSwitchControl: Downstream,
    10 => CommandGpSwitchRelay: Downstream,
    11 => NotificationGaAddMode: Upstream,
    12 => NotificationGaTime: Upstream,
    13 => NotificationGaConnectedSet: Upstream,
    14 => NotificationGpState: Upstream,
    15 => AcknowledgementGpSoftware: Upstream,
    16 => AcknowledgementGaSoftware: Upstream,
    17 => ErrorGpSoftware: Upstream,
    18 => ErrorGaSoftware: Upstream,
    19 => InfoAgentVersions: Upstream,
    20 => InfoEventLog: Upstream,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    pub fn direction(&self) -> Direction {
        self.message_type().direction()
    }

    /// Encode header and payload as one frame at `version`.
    pub fn encode(&self, version: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; HEADER_LEN];
        let flags = self.pack_payload(&mut buf, version)?;
        let header = Header::new(self.message_type(), buf.len() - HEADER_LEN, flags)?;
        buf[..HEADER_LEN].copy_from_slice(&header.encode());
        Ok(buf)
    }

    /// Decode a payload described by `header`.
    ///
    /// Upstream messages may carry trailing bytes from newer firmware, which
    /// are ignored. Downstream messages must match their shape exactly.
    pub fn decode(header: &Header, payload: &[u8], version: u32) -> Result<Self> {
        let mut read = BufferReader::new(payload);
        let message = Self::unpack_payload(header, &mut read, version)?;
        if header.message_type.direction() == Direction::Downstream && !read.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after {}",
                read.remaining(),
                header.message_type
            )));
        }
        Ok(message)
    }
}

pub(crate) fn require_version(message: MessageType, version: u32, min: u32) -> Result<()> {
    if version < min {
        return Err(ProtocolError::NotSupportedAtVersion {
            message: message.name(),
            version,
        });
    }
    Ok(())
}

/// Convert a length to the integer type of its count field.
pub(crate) fn count<T: TryFrom<usize>>(field: &'static str, len: usize) -> Result<T> {
    T::try_from(len).map_err(|_| ProtocolError::InvalidField {
        field,
        value: len.to_string(),
        reason: "too many entries for the count field",
    })
}

pub(crate) fn put_meter(buf: &mut Vec<u8>, meter: &Meter, version: u32) {
    if version == 1 {
        buf.put_i64(meter.id);
    } else {
        put_meter_with_type(buf, meter);
    }
}

pub(crate) fn put_meter_with_type(buf: &mut Vec<u8>, meter: &Meter) {
    buf.put_i8(meter.connection_type);
    buf.put_i64(meter.id);
}

pub(crate) fn put_timestamp(buf: &mut Vec<u8>, timestamp: &DateTime<Utc>) -> Result<()> {
    buf.put_u32(datetime_to_timestamp(timestamp)?);
    Ok(())
}

/// Write `text` as `width` NUL-padded Latin-1 bytes.
pub(crate) fn put_fixed_str(
    buf: &mut Vec<u8>,
    field: &'static str,
    text: &str,
    width: usize,
) -> Result<()> {
    let invalid = |reason| ProtocolError::InvalidField {
        field,
        value: format!("{text:?}"),
        reason,
    };
    let bytes = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| invalid("not representable in Latin-1")))
        .collect::<Result<Vec<u8>>>()?;
    if bytes.len() > width {
        return Err(invalid("longer than the fixed field width"));
    }
    buf.put_slice(&bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

pub(crate) fn put_software_version(
    buf: &mut Vec<u8>,
    field: &'static str,
    version: &SoftwareVersion,
) -> Result<()> {
    buf.put_u8(version.major);
    buf.put_u8(version.minor);
    buf.put_u8(version.revision);
    put_fixed_str(buf, field, &version.extra, SoftwareVersion::EXTRA_LEN)
}
