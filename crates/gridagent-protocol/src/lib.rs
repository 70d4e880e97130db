//! Wire protocol spoken between the GridAgent server and its field agents.
//!
//! This crate provides:
//! - The 12-byte handshake and per-session key derivation
//! - ARCFOUR stream enciphering in both directions
//! - Frame headers, the payload reader and the message catalogue
//! - The JSON payloads exchanged with the back-end bus
//!
//! # Usage
//!
//! ```ignore
//! use gridagent_protocol::{handshake, SharedSecret, SERVER_MAX_PROTOCOL_VERSION};
//!
//! let secret = SharedSecret::from_hex(&hex_secret)?;
//! let (read, write) = stream.into_split();
//! let session = handshake::accept(read, write, &secret, SERVER_MAX_PROTOCOL_VERSION, max_len).await?;
//! ```

pub mod address;
pub mod bus;
pub mod cipher;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod messages;
pub mod reader;
pub mod types;

pub use address::{normalize_mac, parse_agent_id, parse_hex_id, parse_version, ParseError};
pub use bus::{
    AgentSummary, BusCommand, BusEvent, SoftwareTarget, AGENT_ROUTING_PATTERN,
    DEFAULT_AGENT_HW_MODEL, DEFAULT_METER_HW_MODEL, SERVER_ROUTING_KEY,
};
pub use cipher::{Arc4, CipherReader, CipherWriter};
pub use error::{ErrorKind, ProtocolError, Result};
pub use frame::{decode_frame, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LENGTH};
pub use handshake::{
    Established, Hello, SharedSecret, CLIENT_PROTOCOL_VERSION, HANDSHAKE_LEN,
    SERVER_MAX_PROTOCOL_VERSION,
};
pub use header::{Header, HEADER_LEN};
pub use messages::{Direction, Message, MessageType};
pub use types::{
    AgentId, ConnectionType, Measurement, MeasurementSet, MeterData, Meter, Price, Rule,
    RuleSet, SoftwareVersion,
};
