//! Protocol error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while speaking the agent wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the stream, or returned fewer bytes than a read required.
    #[error("end of stream")]
    EndOfStream,

    /// The handshake proposed a protocol version this end cannot speak.
    #[error("protocol version {version} not supported (accepted: 1..={max})")]
    UnsupportedVersion { version: u32, max: u32 },

    /// The frame header names a type id outside the message catalogue.
    #[error("message type {0} unknown")]
    UnknownMessageType(u8),

    /// The payload is too short or too long for the declared shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The declared frame length exceeds the configured cap.
    #[error("frame length {length} exceeds limit of {max} bytes")]
    OversizeFrame { length: u32, max: u32 },

    /// The message has no encoding at the negotiated protocol version.
    #[error("{message} cannot be encoded at protocol version {version}")]
    NotSupportedAtVersion {
        message: &'static str,
        version: u32,
    },

    /// The message is kept only for its type id and is refused at this version.
    #[error("{message} is deprecated at protocol version {version} and carries no payload")]
    Deprecated {
        message: &'static str,
        version: u32,
    },

    /// A value does not fit the wire field it is written to.
    #[error("field `{field}` cannot hold {value}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    /// A timestamp falls outside the 32-bit range counted from 2000-01-01.
    #[error("timestamp {0} outside the ZigBee epoch range")]
    TimestampOutOfRange(DateTime<Utc>),

    /// The shared secret cannot be used for key derivation.
    #[error("invalid shared secret: {0}")]
    InvalidSecret(String),

    /// Transport failure other than a short read.
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::EndOfStream
        } else {
            ProtocolError::Io(err)
        }
    }
}

/// Coarse classification of [`ProtocolError`], used for metrics labels and
/// close-reason reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EndOfStream,
    UnsupportedVersion,
    UnknownMessageType,
    MalformedFrame,
    OversizeFrame,
    Encoding,
    Io,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::EndOfStream => "end_of_stream",
            ErrorKind::UnsupportedVersion => "unsupported_version",
            ErrorKind::UnknownMessageType => "unknown_message_type",
            ErrorKind::MalformedFrame => "malformed_frame",
            ErrorKind::OversizeFrame => "oversize_frame",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProtocolError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::EndOfStream => ErrorKind::EndOfStream,
            ProtocolError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            ProtocolError::UnknownMessageType(_) => ErrorKind::UnknownMessageType,
            ProtocolError::Malformed(_) => ErrorKind::MalformedFrame,
            ProtocolError::OversizeFrame { .. } => ErrorKind::OversizeFrame,
            ProtocolError::NotSupportedAtVersion { .. }
            | ProtocolError::Deprecated { .. }
            | ProtocolError::InvalidField { .. }
            | ProtocolError::TimestampOutOfRange(_)
            | ProtocolError::InvalidSecret(_) => ErrorKind::Encoding,
            ProtocolError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Convenience alias for protocol results.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
