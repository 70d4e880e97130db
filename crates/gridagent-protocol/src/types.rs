//! Data model carried by the message catalogue and the bus payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{self, ParseError};
use crate::error::{ProtocolError, Result};

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z.
pub const ZIGBEE_EPOCH_OFFSET: i64 = 946_684_800;

/// Convert a wire timestamp (seconds since 2000-01-01 UTC) to calendar time.
pub fn timestamp_to_datetime(timestamp: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(timestamp) + ZIGBEE_EPOCH_OFFSET, 0).unwrap_or_default()
}

/// Convert calendar time to a wire timestamp. Sub-second precision is dropped.
pub fn datetime_to_timestamp(datetime: &DateTime<Utc>) -> Result<u32> {
    u32::try_from(datetime.timestamp() - ZIGBEE_EPOCH_OFFSET)
        .map_err(|_| ProtocolError::TimestampOutOfRange(*datetime))
}

/// MAC-derived agent identity.
///
/// Displayed as lower-case hex, zero-padded to 12 digits, which is also the
/// form used in routing keys and bus payloads. Ids wider than a MAC keep all
/// their digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AgentId(u64);

impl AgentId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Routing key for events and commands concerning this agent.
    pub fn routing_key(self) -> String {
        format!("agent.{self}")
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({self})")
    }
}

impl FromStr for AgentId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        address::parse_agent_id(s).map(AgentId)
    }
}

impl TryFrom<String> for AgentId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.to_string()
    }
}

/// Transport a meter is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ConnectionType {
    Unknown = 0,
    ZigBee = 1,
    MBusPrimary = 2,
    MBusGmLegacy = 3,
    KamstrupUtiliDriver = 4,
    PlcMitsubishiFx1s = 5,
    Modbus = 6,
    AuxSerial = 7,
    MBusSecondary = 8,
}

impl ConnectionType {
    pub fn from_raw(raw: i8) -> Option<Self> {
        Some(match raw {
            0 => Self::Unknown,
            1 => Self::ZigBee,
            2 => Self::MBusPrimary,
            3 => Self::MBusGmLegacy,
            4 => Self::KamstrupUtiliDriver,
            5 => Self::PlcMitsubishiFx1s,
            6 => Self::Modbus,
            7 => Self::AuxSerial,
            8 => Self::MBusSecondary,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::ZigBee => "ZigBee",
            Self::MBusPrimary => "MBus primary",
            Self::MBusGmLegacy => "MBus GM legacy",
            Self::KamstrupUtiliDriver => "Kamstrup UtiliDriver",
            Self::PlcMitsubishiFx1s => "PLC Mitsubishi FX1S",
            Self::Modbus => "Modbus",
            Self::AuxSerial => "Aux Serial",
            Self::MBusSecondary => "MBus secondary",
        }
    }
}

/// What a measurement measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum MeasurementType {
    Unknown = 0,
    Electricity = 1,
    Heat = 2,
}

impl MeasurementType {
    pub fn from_raw(raw: i8) -> Option<Self> {
        Some(match raw {
            0 => Self::Unknown,
            1 => Self::Electricity,
            2 => Self::Heat,
            _ => return None,
        })
    }
}

/// Unit of a raw measurement value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum MeasurementUnit {
    Unknown = 0,
    MilliWattHour = 1,
    MilliWatt = 2,
    PulseCount = 3,
    MicroCubicMetre = 4,
    MicroCubicMetrePerHour = 5,
    MilliDegreeCelsius = 6,
    MilliVolt = 7,
    MilliAmpere = 8,
    MilliHertz = 9,
    Gram = 10,
    MilliBar = 11,
    Second = 12,
}

impl MeasurementUnit {
    pub fn from_raw(raw: i8) -> Option<Self> {
        Some(match raw {
            0 => Self::Unknown,
            1 => Self::MilliWattHour,
            2 => Self::MilliWatt,
            3 => Self::PulseCount,
            4 => Self::MicroCubicMetre,
            5 => Self::MicroCubicMetrePerHour,
            6 => Self::MilliDegreeCelsius,
            7 => Self::MilliVolt,
            8 => Self::MilliAmpere,
            9 => Self::MilliHertz,
            10 => Self::Gram,
            11 => Self::MilliBar,
            12 => Self::Second,
            _ => return None,
        })
    }

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::MilliWattHour => "mWh",
            Self::MilliWatt => "mW",
            Self::PulseCount => "pulse count",
            Self::MicroCubicMetre => "um^3",
            Self::MicroCubicMetrePerHour => "um^3/h",
            Self::MilliDegreeCelsius => "mdegC",
            Self::MilliVolt => "mV",
            Self::MilliAmpere => "mA",
            Self::MilliHertz => "mHz",
            Self::Gram => "g",
            Self::MilliBar => "mbar",
            Self::Second => "s",
        }
    }
}

/// A device behind an agent. Version 1 peers only know `id`; such meters
/// decode with `connection_type == 0`.
///
/// Bus payloads may name a meter either as `{connection_type, id}` or as a
/// 16-digit hex string, which is taken to be a ZigBee address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "MeterRepr")]
pub struct Meter {
    pub connection_type: i8,
    pub id: i64,
}

impl Meter {
    pub const fn new(connection_type: i8, id: i64) -> Self {
        Self {
            connection_type,
            id,
        }
    }

    /// A meter as seen by a version 1 peer.
    pub const fn legacy(id: i64) -> Self {
        Self::new(0, id)
    }

    /// A ZigBee meter from its 64-bit address, reinterpreted as signed.
    pub const fn zigbee(address: u64) -> Self {
        Self::new(ConnectionType::ZigBee as i8, address as i64)
    }

    pub fn kind(&self) -> Option<ConnectionType> {
        ConnectionType::from_raw(self.connection_type)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MeterRepr {
    Hex(String),
    Fields { connection_type: i8, id: i64 },
}

impl TryFrom<MeterRepr> for Meter {
    type Error = ParseError;

    fn try_from(repr: MeterRepr) -> Result<Self, Self::Error> {
        match repr {
            MeterRepr::Hex(address) => address::parse_hex_id(&address, 8).map(Meter::zigbee),
            MeterRepr::Fields { connection_type, id } => Ok(Meter::new(connection_type, id)),
        }
    }
}

/// One raw reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "type")]
    pub measurement_type: i8,
    pub unit: i8,
    pub input_number: i8,
    pub value: i64,
}

impl Measurement {
    pub const fn new(measurement_type: i8, unit: i8, input_number: i8, value: i64) -> Self {
        Self {
            measurement_type,
            unit,
            input_number,
            value,
        }
    }
}

/// Readings taken at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementSet {
    pub timestamp: DateTime<Utc>,
    pub measurements: Vec<Measurement>,
}

/// All measurement sets reported for one meter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeterData {
    pub meter: Meter,
    pub measurement_sets: Vec<MeasurementSet>,
}

/// Relay schedule entry. Start and end are raw wire timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub relay_on: bool,
    pub start_time: u32,
    pub end_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub override_timeout: i32,
    pub rules: Vec<Rule>,
    pub meters: Vec<Meter>,
}

/// Price for an interval. The unit of `price` is opaque to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub price: u32,
}

/// Measurement interval for a meter (version 1 `ConfigGp` only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementInterval {
    pub meter_id: i64,
    pub interval_seconds: i32,
}

/// Software or hardware revision.
///
/// On the wire `extra` occupies 12 NUL-padded Latin-1 bytes and is truncated
/// at the first NUL when decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SoftwareVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub extra: String,
}

impl SoftwareVersion {
    /// Width of the `extra` field on the wire.
    pub const EXTRA_LEN: usize = 12;

    /// Encoded size: three version bytes plus `extra`.
    pub const WIRE_SIZE: usize = 3 + Self::EXTRA_LEN;

    pub fn new(major: u8, minor: u8, revision: u8, extra: impl Into<String>) -> Self {
        Self {
            major,
            minor,
            revision,
            extra: extra.into(),
        }
    }
}

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}{}",
            self.major, self.minor, self.revision, self.extra
        )
    }
}

impl FromStr for SoftwareVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        address::parse_version(s)
    }
}

impl Serialize for SoftwareVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepted bus forms: `"2.1.0rc1"` or `[2, 1, 0, "rc1"]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum VersionRepr {
    Text(String),
    Parts(u8, u8, u8, String),
    Numbers(u8, u8, u8),
}

impl<'de> Deserialize<'de> for SoftwareVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match VersionRepr::deserialize(deserializer)? {
            VersionRepr::Text(raw) => raw.parse().map_err(serde::de::Error::custom),
            VersionRepr::Parts(major, minor, revision, extra) => {
                Ok(SoftwareVersion::new(major, minor, revision, extra))
            }
            VersionRepr::Numbers(major, minor, revision) => {
                Ok(SoftwareVersion::new(major, minor, revision, ""))
            }
        }
    }
}
