//! Agent to server messages.
//!
//! Agents are the only producers of these in production. The pack side
//! exists for agent simulators and tests.

use bytes::BufMut;
use chrono::{DateTime, Utc};

use super::{
    count, put_fixed_str, put_meter, put_meter_with_type, put_software_version, put_timestamp,
    require_version, MessageType, WireMessage,
};
use crate::error::Result;
use crate::header::Header;
use crate::reader::BufferReader;
use crate::types::{
    timestamp_to_datetime, Measurement, MeasurementSet, Meter, MeterData, SoftwareVersion,
};

/// Measurement upload.
///
/// Version 1 agents send a flat `(meter id, timestamp, value)` list; it is
/// sorted and grouped per meter on decode so both shapes yield the same
/// structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkMeasurements {
    pub meter_data: Vec<MeterData>,
}

impl BulkMeasurements {
    fn unpack_flat(read: &mut BufferReader<'_>) -> Result<Self> {
        let n = read.u32()? as usize;
        let mut entries = read.read_list(n, 20, |r| Ok((r.i64()?, r.u32()?, r.i64()?)))?;
        entries.sort_unstable();

        let mut meter_data: Vec<MeterData> = Vec::new();
        for (id, timestamp, value) in entries {
            let set = MeasurementSet {
                timestamp: timestamp_to_datetime(timestamp),
                measurements: vec![Measurement::new(0, 0, 0, value)],
            };
            match meter_data.last_mut() {
                Some(current) if current.meter.id == id => current.measurement_sets.push(set),
                _ => meter_data.push(MeterData {
                    meter: Meter::legacy(id),
                    measurement_sets: vec![set],
                }),
            }
        }
        Ok(Self { meter_data })
    }

    fn unpack_nested(read: &mut BufferReader<'_>) -> Result<Self> {
        let n = usize::from(read.u16()?);
        let meter_data = read.read_list(n, 11, |r| {
            let meter = r.meter_with_type()?;
            let sets = usize::from(r.u16()?);
            let measurement_sets = r.read_list(sets, 6, |r| {
                let timestamp = r.timestamp()?;
                let measurements = usize::from(r.u16()?);
                let measurements = r.read_list(measurements, 11, |r| {
                    Ok(Measurement::new(r.i8()?, r.i8()?, r.i8()?, r.i64()?))
                })?;
                Ok(MeasurementSet {
                    timestamp,
                    measurements,
                })
            })?;
            Ok(MeterData {
                meter,
                measurement_sets,
            })
        })?;
        Ok(Self { meter_data })
    }
}

impl WireMessage for BulkMeasurements {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        require_version(MessageType::BulkMeasurements, version, 2)?;
        buf.put_u16(count("meter_data", self.meter_data.len())?);
        for data in &self.meter_data {
            put_meter_with_type(buf, &data.meter);
            buf.put_u16(count("measurement_sets", data.measurement_sets.len())?);
            for set in &data.measurement_sets {
                put_timestamp(buf, &set.timestamp)?;
                buf.put_u16(count("measurements", set.measurements.len())?);
                for measurement in &set.measurements {
                    buf.put_i8(measurement.measurement_type);
                    buf.put_i8(measurement.unit);
                    buf.put_i8(measurement.input_number);
                    buf.put_i64(measurement.value);
                }
            }
        }
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        if version == 1 {
            Self::unpack_flat(read)
        } else {
            Self::unpack_nested(read)
        }
    }
}

/// Agent entered or left ZigBee add mode. The state travels in flag bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationGaAddMode {
    pub timestamp: DateTime<Utc>,
    pub in_add_mode: bool,
}

impl WireMessage for NotificationGaAddMode {
    fn pack(&self, buf: &mut Vec<u8>, _version: u32) -> Result<u8> {
        put_timestamp(buf, &self.timestamp)?;
        Ok(u8::from(self.in_add_mode))
    }

    fn unpack(header: &Header, read: &mut BufferReader<'_>, _version: u32) -> Result<Self> {
        Ok(Self {
            timestamp: read.timestamp()?,
            in_add_mode: header.flags & 1 != 0,
        })
    }
}

/// The agent's current clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationGaTime {
    pub timestamp: DateTime<Utc>,
}

impl WireMessage for NotificationGaTime {
    fn pack(&self, buf: &mut Vec<u8>, _version: u32) -> Result<u8> {
        put_timestamp(buf, &self.timestamp)?;
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, _version: u32) -> Result<Self> {
        Ok(Self {
            timestamp: read.timestamp()?,
        })
    }
}

/// Meters currently reachable through the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationGaConnectedSet {
    pub meters: Vec<Meter>,
}

impl WireMessage for NotificationGaConnectedSet {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        require_version(MessageType::NotificationGaConnectedSet, version, 2)?;
        buf.put_u32(count("meters", self.meters.len())?);
        for meter in &self.meters {
            put_meter(buf, meter, version);
        }
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        let meter_size = if version == 1 { 8 } else { 9 };
        let n = read.u32()? as usize;
        let meters = read.read_list(n, meter_size, |r| r.meter(version))?;
        Ok(Self { meters })
    }
}

const STATE_ONLINE: u8 = 1;
const STATE_CONTROL_MANUAL: u8 = 2;
const STATE_RELAY_ON: u8 = 4;

/// Relay and control state of one meter. The booleans travel in the header
/// flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationGpState {
    pub meter: Meter,
    pub online: bool,
    pub control_manual: bool,
    pub relay_on: bool,
    pub timestamp: DateTime<Utc>,
}

impl WireMessage for NotificationGpState {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        require_version(MessageType::NotificationGpState, version, 2)?;
        put_timestamp(buf, &self.timestamp)?;
        put_meter(buf, &self.meter, version);

        let mut flags = 0;
        if self.online {
            flags |= STATE_ONLINE;
        }
        if self.control_manual {
            flags |= STATE_CONTROL_MANUAL;
        }
        if self.relay_on {
            flags |= STATE_RELAY_ON;
        }
        Ok(flags)
    }

    fn unpack(header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        let timestamp = read.timestamp()?;
        let meter = read.meter(version)?;
        Ok(Self {
            meter,
            online: header.flags & STATE_ONLINE != 0,
            control_manual: header.flags & STATE_CONTROL_MANUAL != 0,
            relay_on: header.flags & STATE_RELAY_ON != 0,
            timestamp,
        })
    }
}

macro_rules! empty_upstream {
    ($($(#[$doc:meta])* $name:ident;)*) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
            pub struct $name;

            impl WireMessage for $name {
                fn pack(&self, _buf: &mut Vec<u8>, _version: u32) -> Result<u8> {
                    Ok(0)
                }

                fn unpack(
                    _header: &Header,
                    _read: &mut BufferReader<'_>,
                    _version: u32,
                ) -> Result<Self> {
                    Ok(Self)
                }
            }
        )*
    };
}

empty_upstream! {
    /// Meter firmware accepted.
    AcknowledgementGpSoftware;
    /// Agent firmware accepted.
    AcknowledgementGaSoftware;
    /// Meter firmware rejected.
    ErrorGpSoftware;
    /// Agent firmware rejected.
    ErrorGaSoftware;
}

/// Firmware and hardware identification of the agent (version 3 and later).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoAgentVersions {
    pub sw_version: SoftwareVersion,
    pub device_type: u8,
    pub hw_revision: SoftwareVersion,
    pub serial: i32,
}

impl WireMessage for InfoAgentVersions {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        require_version(MessageType::InfoAgentVersions, version, 3)?;
        put_software_version(buf, "sw_version", &self.sw_version)?;
        buf.put_u8(self.device_type);
        put_software_version(buf, "hw_revision", &self.hw_revision)?;
        buf.put_i32(self.serial);
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        require_version(MessageType::InfoAgentVersions, version, 3)?;
        Ok(Self {
            sw_version: read.software_version()?,
            device_type: read.u8()?,
            hw_revision: read.software_version()?,
            serial: read.i32()?,
        })
    }
}

/// One agent event log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEventLog {
    pub timestamp: DateTime<Utc>,
    pub code: i16,
    pub text: String,
}

impl InfoEventLog {
    /// Width of the NUL-padded text field.
    pub const TEXT_LEN: usize = 128;
}

impl WireMessage for InfoEventLog {
    fn pack(&self, buf: &mut Vec<u8>, _version: u32) -> Result<u8> {
        put_timestamp(buf, &self.timestamp)?;
        buf.put_i16(self.code);
        put_fixed_str(buf, "text", &self.text, Self::TEXT_LEN)?;
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, _version: u32) -> Result<Self> {
        Ok(Self {
            timestamp: read.timestamp()?,
            code: read.i16()?,
            text: read.fixed_str(Self::TEXT_LEN)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::messages::Message;
    use chrono::{TimeZone, Timelike};

    fn decode(message_type: MessageType, flags: u8, payload: &[u8], version: u32) -> Message {
        let header = Header::new(message_type, payload.len(), flags).unwrap();
        Message::decode(&header, payload, version).unwrap()
    }

    #[test]
    fn flat_measurements_are_sorted_and_grouped() {
        #[rustfmt::skip]
        let payload = [
            0, 0, 0, 3,
            // meter 2, ts 20, value 7
            0, 0, 0, 0, 0, 0, 0, 2,  0, 0, 0, 20,  0, 0, 0, 0, 0, 0, 0, 7,
            // meter 1, ts 10, value 5
            0, 0, 0, 0, 0, 0, 0, 1,  0, 0, 0, 10,  0, 0, 0, 0, 0, 0, 0, 5,
            // meter 2, ts 10, value 6
            0, 0, 0, 0, 0, 0, 0, 2,  0, 0, 0, 10,  0, 0, 0, 0, 0, 0, 0, 6,
        ];
        let Message::BulkMeasurements(bulk) = decode(MessageType::BulkMeasurements, 0, &payload, 1)
        else {
            panic!("wrong message type");
        };

        assert_eq!(bulk.meter_data.len(), 2);
        assert_eq!(bulk.meter_data[0].meter, Meter::legacy(1));
        assert_eq!(bulk.meter_data[0].measurement_sets.len(), 1);

        let second = &bulk.meter_data[1];
        assert_eq!(second.meter, Meter::legacy(2));
        let values: Vec<(u32, i64)> = second
            .measurement_sets
            .iter()
            .map(|set| {
                (
                    crate::types::datetime_to_timestamp(&set.timestamp).unwrap(),
                    set.measurements[0].value,
                )
            })
            .collect();
        assert_eq!(values, vec![(10, 6), (20, 7)]);
    }

    #[test]
    fn bulk_measurements_pack_needs_version_2() {
        let message = Message::from(BulkMeasurements::default());
        assert!(matches!(
            message.encode(1),
            Err(ProtocolError::NotSupportedAtVersion { version: 1, .. })
        ));
        assert_eq!(message.encode(2).unwrap(), [0, 0, 0, 10, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn add_mode_time_of_day() {
        let Message::NotificationGaAddMode(add_mode) =
            decode(MessageType::NotificationGaAddMode, 1, &[0x00, 0x00, 0xA4, 0xB2], 1)
        else {
            panic!("wrong message type");
        };
        assert!(add_mode.in_add_mode);
        assert_eq!(
            (
                add_mode.timestamp.hour(),
                add_mode.timestamp.minute(),
                add_mode.timestamp.second()
            ),
            (11, 42, 42)
        );
    }

    #[test]
    fn connected_set_version_1_ids() {
        let payload = [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0x12, 0x34];
        let Message::NotificationGaConnectedSet(set) =
            decode(MessageType::NotificationGaConnectedSet, 0, &payload, 1)
        else {
            panic!("wrong message type");
        };
        assert_eq!(set.meters, vec![Meter::legacy(0x1234)]);
    }

    #[test]
    fn gp_state_flags() {
        let timestamp = Utc.with_ymd_and_hms(2020, 5, 5, 5, 5, 5).unwrap();
        let state = NotificationGpState {
            meter: Meter::new(1, 42),
            online: true,
            control_manual: true,
            relay_on: false,
            timestamp,
        };
        let frame = Message::from(state).encode(2).unwrap();
        assert_eq!(frame[7], STATE_ONLINE | STATE_CONTROL_MANUAL);
        assert_eq!(
            decode(MessageType::NotificationGpState, frame[7], &frame[8..], 2),
            Message::from(state)
        );
    }

    #[test]
    fn agent_versions_extra_truncated_at_nul() {
        let mut payload = vec![1, 2, 3];
        payload.extend_from_slice(b"beta\0junk\0\0\0");
        payload.push(7);
        payload.extend_from_slice(&[4, 0, 0]);
        payload.extend_from_slice(&[0; 12]);
        payload.extend_from_slice(&(-5i32).to_be_bytes());

        let Message::InfoAgentVersions(info) =
            decode(MessageType::InfoAgentVersions, 0, &payload, 3)
        else {
            panic!("wrong message type");
        };
        assert_eq!(info.sw_version, SoftwareVersion::new(1, 2, 3, "beta"));
        assert_eq!(info.device_type, 7);
        assert_eq!(info.hw_revision, SoftwareVersion::new(4, 0, 0, ""));
        assert_eq!(info.serial, -5);
    }

    #[test]
    fn agent_versions_rejected_below_version_3() {
        let header = Header::new(MessageType::InfoAgentVersions, 0, 0).unwrap();
        assert!(matches!(
            Message::decode(&header, &[], 2),
            Err(ProtocolError::NotSupportedAtVersion { .. })
        ));
    }

    #[test]
    fn event_log_text_is_fixed_width() {
        let entry = InfoEventLog {
            timestamp: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            code: 12,
            text: "meter offline".to_string(),
        };
        let frame = Message::from(entry.clone()).encode(1).unwrap();
        assert_eq!(frame.len(), 8 + 4 + 2 + InfoEventLog::TEXT_LEN);
        assert_eq!(
            decode(MessageType::InfoEventLog, 0, &frame[8..], 1),
            Message::from(entry)
        );
    }
}
