//! Server to agent messages.

use bytes::BufMut;
use chrono::{DateTime, Utc};

use super::{
    count, put_meter, put_meter_with_type, put_software_version, put_timestamp,
    require_version, MessageType, WireMessage,
};
use crate::error::{ProtocolError, Result};
use crate::header::Header;
use crate::reader::BufferReader;
use crate::types::{MeasurementInterval, Meter, Price, Rule, RuleSet, SoftwareVersion};

/// Measurement interval configuration.
///
/// Only version 1 agents read a payload. From version 2 on the message is
/// empty; it keeps its type id but a non-empty interval list is refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigGp {
    pub intervals: Vec<MeasurementInterval>,
}

impl WireMessage for ConfigGp {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        if version == 1 {
            buf.put_u32(count("intervals", self.intervals.len())?);
            for interval in &self.intervals {
                buf.put_i64(interval.meter_id);
                buf.put_i32(interval.interval_seconds);
            }
        } else if !self.intervals.is_empty() {
            return Err(ProtocolError::Deprecated {
                message: MessageType::ConfigGp.name(),
                version,
            });
        }
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        if version != 1 {
            return Ok(Self::default());
        }
        let n = read.u32()? as usize;
        let intervals = read.read_list(n, 12, |r| {
            Ok(MeasurementInterval {
                meter_id: r.i64()?,
                interval_seconds: r.i32()?,
            })
        })?;
        Ok(Self { intervals })
    }
}

/// Relay schedules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigGaRulesets {
    pub rulesets: Vec<RuleSet>,
}

impl WireMessage for ConfigGaRulesets {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        buf.put_u32(count("rulesets", self.rulesets.len())?);
        for ruleset in &self.rulesets {
            buf.put_i32(ruleset.override_timeout);
            buf.put_i16(count("rules", ruleset.rules.len())?);
            buf.put_i16(count("meters", ruleset.meters.len())?);
            for rule in &ruleset.rules {
                buf.put_bytes(0, 3);
                buf.put_u8(u8::from(rule.relay_on));
                buf.put_u32(rule.start_time);
                buf.put_u32(rule.end_time);
            }
            for meter in &ruleset.meters {
                put_meter(buf, meter, version);
            }
        }
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        let meter_size = if version == 1 { 8 } else { 9 };
        let n = read.u32()? as usize;
        let rulesets = read.read_list(n, 8, |r| {
            let override_timeout = r.i32()?;
            let rule_count = non_negative("rules", r.i16()?)?;
            let meter_count = non_negative("meters", r.i16()?)?;
            let rules = r.read_list(rule_count, 12, |r| {
                r.skip(3)?;
                Ok(Rule {
                    relay_on: r.bool()?,
                    start_time: r.u32()?,
                    end_time: r.u32()?,
                })
            })?;
            let meters = r.read_list(meter_count, meter_size, |r| r.meter(version))?;
            Ok(RuleSet {
                override_timeout,
                rules,
                meters,
            })
        })?;
        Ok(Self { rulesets })
    }
}

fn non_negative(field: &str, n: i16) -> Result<usize> {
    usize::try_from(n)
        .map_err(|_| ProtocolError::Malformed(format!("negative {field} count {n}")))
}

/// Set the agent clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigGaTime {
    pub timestamp: DateTime<Utc>,
}

impl WireMessage for ConfigGaTime {
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

/// Tariff table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigGaPrices {
    pub prices: Vec<Price>,
}

impl WireMessage for ConfigGaPrices {
    fn pack(&self, buf: &mut Vec<u8>, _version: u32) -> Result<u8> {
        buf.put_bytes(0, 2);
        buf.put_u16(count("prices", self.prices.len())?);
        for price in &self.prices {
            put_timestamp(buf, &price.start)?;
            put_timestamp(buf, &price.end)?;
            buf.put_u32(price.price);
        }
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, _version: u32) -> Result<Self> {
        read.skip(2)?;
        let n = usize::from(read.u16()?);
        let prices = read.read_list(n, 12, |r| {
            Ok(Price {
                start: r.timestamp()?,
                end: r.timestamp()?,
                price: r.u32()?,
            })
        })?;
        Ok(Self { prices })
    }
}

/// Firmware image for meters behind an agent (version 3 and later).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigGpSoftware {
    pub sw_version: SoftwareVersion,
    pub hw_model: u8,
    pub target_hw_version: SoftwareVersion,
    pub meters: Vec<Meter>,
    pub image: Vec<u8>,
}

impl WireMessage for ConfigGpSoftware {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        require_version(MessageType::ConfigGpSoftware, version, 3)?;
        let image_offset = 4 + 2 * SoftwareVersion::WIRE_SIZE + 1 + 4 + self.meters.len() * 9;
        buf.put_u32(count("image_offset", image_offset)?);
        put_software_version(buf, "sw_version", &self.sw_version)?;
        buf.put_u8(self.hw_model);
        put_software_version(buf, "target_hw_version", &self.target_hw_version)?;
        buf.put_u32(count("meters", self.meters.len())?);
        for meter in &self.meters {
            put_meter_with_type(buf, meter);
        }
        buf.put_slice(&self.image);
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        require_version(MessageType::ConfigGpSoftware, version, 3)?;
        // the image always follows the meter list, so the offset is redundant
        let _image_offset = read.u32()?;
        let sw_version = read.software_version()?;
        let hw_model = read.u8()?;
        let target_hw_version = read.software_version()?;
        let n = read.u32()? as usize;
        let meters = read.read_list(n, 9, BufferReader::meter_with_type)?;
        let image = read.raw(None)?.to_vec();
        Ok(Self {
            sw_version,
            hw_model,
            target_hw_version,
            meters,
            image,
        })
    }
}

/// Firmware image for the agent itself (version 3 and later).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigGaSoftware {
    pub sw_version: SoftwareVersion,
    pub hw_model: u8,
    pub target_hw_version: SoftwareVersion,
    pub image: Vec<u8>,
}

impl WireMessage for ConfigGaSoftware {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        require_version(MessageType::ConfigGaSoftware, version, 3)?;
        let image_offset = 4 + 2 * SoftwareVersion::WIRE_SIZE + 1;
        buf.put_u32(count("image_offset", image_offset)?);
        put_software_version(buf, "sw_version", &self.sw_version)?;
        buf.put_u8(self.hw_model);
        put_software_version(buf, "target_hw_version", &self.target_hw_version)?;
        buf.put_slice(&self.image);
        Ok(0)
    }

    fn unpack(_header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        require_version(MessageType::ConfigGaSoftware, version, 3)?;
        let _image_offset = read.u32()?;
        Ok(Self {
            sw_version: read.software_version()?,
            hw_model: read.u8()?,
            target_hw_version: read.software_version()?,
            image: read.raw(None)?.to_vec(),
        })
    }
}

/// Ask the agent to upload measurements now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandGaPollMeasurements;

impl WireMessage for CommandGaPollMeasurements {
    fn pack(&self, _buf: &mut Vec<u8>, _version: u32) -> Result<u8> {
        Ok(0)
    }

    fn unpack(_header: &Header, _read: &mut BufferReader<'_>, _version: u32) -> Result<Self> {
        Ok(Self)
    }
}

/// Ask the agent to push its clock to the meters behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandGaPropagateTime;

impl WireMessage for CommandGaPropagateTime {
    fn pack(&self, _buf: &mut Vec<u8>, _version: u32) -> Result<u8> {
        Ok(0)
    }

    fn unpack(_header: &Header, _read: &mut BufferReader<'_>, _version: u32) -> Result<Self> {
        Ok(Self)
    }
}

/// Switch a meter between automatic (rule driven) and manual relay control.
/// `control_manual` travels in header flag bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandGpSwitchControl {
    pub meter: Meter,
    pub control_manual: bool,
}

impl WireMessage for CommandGpSwitchControl {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        put_meter(buf, &self.meter, version);
        Ok(u8::from(self.control_manual))
    }

    fn unpack(header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        Ok(Self {
            meter: read.meter(version)?,
            control_manual: header.flags & 1 != 0,
        })
    }
}

/// Switch a meter relay. `relay_on` travels in header flag bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandGpSwitchRelay {
    pub meter: Meter,
    pub relay_on: bool,
}

impl WireMessage for CommandGpSwitchRelay {
    fn pack(&self, buf: &mut Vec<u8>, version: u32) -> Result<u8> {
        put_meter(buf, &self.meter, version);
        Ok(u8::from(self.relay_on))
    }

    fn unpack(header: &Header, read: &mut BufferReader<'_>, version: u32) -> Result<Self> {
        Ok(Self {
            meter: read.meter(version)?,
            relay_on: header.flags & 1 != 0,
        })
    }
}
