//! JSON payloads exchanged with the back-end topic bus.
//!
//! Commands arrive on [`SERVER_ROUTING_KEY`] or on an agent's own routing key
//! and carry a `command` field. Events are published by the server and carry
//! an `event` field instead, which is how the bridge tells its own traffic
//! apart when it loops back through [`AGENT_ROUTING_PATTERN`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::Message;
use crate::types::{AgentId, Meter, MeterData, RuleSet, SoftwareVersion};

/// Routing key for server-wide commands and lifecycle events.
pub const SERVER_ROUTING_KEY: &str = "agentserver";

/// Subscription pattern matching every per-agent routing key.
pub const AGENT_ROUTING_PATTERN: &str = "agent.*";

/// Hardware model assumed for agent images when the command names none.
pub const DEFAULT_AGENT_HW_MODEL: u8 = 1;

/// Hardware model assumed for meter images when the command names none.
pub const DEFAULT_METER_HW_MODEL: u8 = 3;

fn default_agent_hw_model() -> u8 {
    DEFAULT_AGENT_HW_MODEL
}

fn default_meter_hw_model() -> u8 {
    DEFAULT_METER_HW_MODEL
}

/// A control or configuration request addressed to the server or an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BusCommand {
    /// List connected agents. Answered with [`BusEvent::CurrentAgents`].
    CurrentAgents,
    RelayState {
        agent: AgentId,
        relay_on: bool,
        meters: Vec<Meter>,
    },
    ControlMode {
        agent: AgentId,
        control_manual: bool,
        meters: Vec<Meter>,
    },
    GridagentRules {
        agent: AgentId,
        rulesets: Vec<RuleSet>,
    },
    GridagentSoftware {
        agent: AgentId,
        sw_version: SoftwareVersion,
        #[serde(default = "default_agent_hw_model")]
        hw_model: u8,
        target_hw_version: SoftwareVersion,
    },
    GridpointSoftware {
        agent: AgentId,
        sw_version: SoftwareVersion,
        #[serde(default = "default_meter_hw_model")]
        hw_model: u8,
        target_hw_version: SoftwareVersion,
        meters: Vec<Meter>,
    },
}

impl BusCommand {
    /// Parse a bus payload.
    ///
    /// Returns `Ok(None)` for JSON objects without a `command` field; those
    /// are events, not requests.
    pub fn from_payload(payload: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        if value.get("command").is_none() {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BusCommand::CurrentAgents => "current_agents",
            BusCommand::RelayState { .. } => "relay_state",
            BusCommand::ControlMode { .. } => "control_mode",
            BusCommand::GridagentRules { .. } => "gridagent_rules",
            BusCommand::GridagentSoftware { .. } => "gridagent_software",
            BusCommand::GridpointSoftware { .. } => "gridpoint_software",
        }
    }

    /// The agent a command is aimed at, if any.
    pub fn agent(&self) -> Option<AgentId> {
        match self {
            BusCommand::CurrentAgents => None,
            BusCommand::RelayState { agent, .. }
            | BusCommand::ControlMode { agent, .. }
            | BusCommand::GridagentRules { agent, .. }
            | BusCommand::GridagentSoftware { agent, .. }
            | BusCommand::GridpointSoftware { agent, .. } => Some(*agent),
        }
    }

    /// Routing key senders publish this command under.
    pub fn routing_key(&self) -> String {
        match self.agent() {
            Some(agent) => agent.routing_key(),
            None => SERVER_ROUTING_KEY.to_string(),
        }
    }
}

/// Which device a software acknowledgement or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftwareTarget {
    Gridagent,
    Gridpoint,
}

/// One entry of the `current_agents` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent: AgentId,
    pub protocol_version: u32,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub serial: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<SoftwareVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_revision: Option<SoftwareVersion>,
}

/// Something the server reports to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    AgentConnected {
        agent: AgentId,
        protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },
    AgentDisconnected {
        agent: AgentId,
        reason: String,
    },
    Measurements {
        agent: AgentId,
        meter_data: Vec<MeterData>,
    },
    AddMode {
        agent: AgentId,
        timestamp: DateTime<Utc>,
        in_add_mode: bool,
    },
    AgentTime {
        agent: AgentId,
        timestamp: DateTime<Utc>,
    },
    ConnectedSet {
        agent: AgentId,
        meters: Vec<Meter>,
    },
    MeterState {
        agent: AgentId,
        meter: Meter,
        online: bool,
        control_manual: bool,
        relay_on: bool,
        timestamp: DateTime<Utc>,
    },
    SoftwareAcknowledged {
        agent: AgentId,
        target: SoftwareTarget,
    },
    SoftwareFailed {
        agent: AgentId,
        target: SoftwareTarget,
    },
    AgentVersions {
        agent: AgentId,
        sw_version: SoftwareVersion,
        device_type: u8,
        hw_revision: SoftwareVersion,
        serial: i32,
    },
    EventLog {
        agent: AgentId,
        timestamp: DateTime<Utc>,
        code: i16,
        text: String,
    },
    CurrentAgents {
        agents: Vec<AgentSummary>,
    },
}

impl BusEvent {
    /// The bus form of an upstream message. Downstream messages have none.
    pub fn from_upstream(agent: AgentId, message: &Message) -> Option<Self> {
        Some(match message {
            Message::BulkMeasurements(m) => BusEvent::Measurements {
                agent,
                meter_data: m.meter_data.clone(),
            },
            Message::NotificationGaAddMode(m) => BusEvent::AddMode {
                agent,
                timestamp: m.timestamp,
                in_add_mode: m.in_add_mode,
            },
            Message::NotificationGaTime(m) => BusEvent::AgentTime {
                agent,
                timestamp: m.timestamp,
            },
            Message::NotificationGaConnectedSet(m) => BusEvent::ConnectedSet {
                agent,
                meters: m.meters.clone(),
            },
            Message::NotificationGpState(m) => BusEvent::MeterState {
                agent,
                meter: m.meter,
                online: m.online,
                control_manual: m.control_manual,
                relay_on: m.relay_on,
                timestamp: m.timestamp,
            },
            Message::AcknowledgementGpSoftware(_) => BusEvent::SoftwareAcknowledged {
                agent,
                target: SoftwareTarget::Gridpoint,
            },
            Message::AcknowledgementGaSoftware(_) => BusEvent::SoftwareAcknowledged {
                agent,
                target: SoftwareTarget::Gridagent,
            },
            Message::ErrorGpSoftware(_) => BusEvent::SoftwareFailed {
                agent,
                target: SoftwareTarget::Gridpoint,
            },
            Message::ErrorGaSoftware(_) => BusEvent::SoftwareFailed {
                agent,
                target: SoftwareTarget::Gridagent,
            },
            Message::InfoAgentVersions(m) => BusEvent::AgentVersions {
                agent,
                sw_version: m.sw_version.clone(),
                device_type: m.device_type,
                hw_revision: m.hw_revision.clone(),
                serial: m.serial,
            },
            Message::InfoEventLog(m) => BusEvent::EventLog {
                agent,
                timestamp: m.timestamp,
                code: m.code,
                text: m.text.clone(),
            },
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::AgentConnected { .. } => "agent_connected",
            BusEvent::AgentDisconnected { .. } => "agent_disconnected",
            BusEvent::Measurements { .. } => "measurements",
            BusEvent::AddMode { .. } => "add_mode",
            BusEvent::AgentTime { .. } => "agent_time",
            BusEvent::ConnectedSet { .. } => "connected_set",
            BusEvent::MeterState { .. } => "meter_state",
            BusEvent::SoftwareAcknowledged { .. } => "software_acknowledged",
            BusEvent::SoftwareFailed { .. } => "software_failed",
            BusEvent::AgentVersions { .. } => "agent_versions",
            BusEvent::EventLog { .. } => "event_log",
            BusEvent::CurrentAgents { .. } => "current_agents",
        }
    }

    /// Lifecycle events and the agent listing go to [`SERVER_ROUTING_KEY`];
    /// everything else to the agent's own key.
    pub fn routing_key(&self) -> String {
        match self {
            BusEvent::AgentConnected { .. }
            | BusEvent::AgentDisconnected { .. }
            | BusEvent::CurrentAgents { .. } => SERVER_ROUTING_KEY.to_string(),
            BusEvent::Measurements { agent, .. }
            | BusEvent::AddMode { agent, .. }
            | BusEvent::AgentTime { agent, .. }
            | BusEvent::ConnectedSet { agent, .. }
            | BusEvent::MeterState { agent, .. }
            | BusEvent::SoftwareAcknowledged { agent, .. }
            | BusEvent::SoftwareFailed { agent, .. }
            | BusEvent::AgentVersions { agent, .. }
            | BusEvent::EventLog { agent, .. } => agent.routing_key(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
