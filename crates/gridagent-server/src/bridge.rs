//! Bus bridge: turns bus commands into downstream messages.
//!
//! Subscribes to [`SERVER_ROUTING_KEY`] and [`AGENT_ROUTING_PATTERN`].
//! Payloads without a `command` field are the server's own events coming
//! back through the wildcard subscription and are skipped.
//!
//! Commands naming an agent run in order on a lane task for that agent, so
//! a session with a full outbound queue only delays its own commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gridagent_protocol::messages::{
    CommandGpSwitchControl, CommandGpSwitchRelay, ConfigGaRulesets, ConfigGaSoftware,
    ConfigGpSoftware,
};
use gridagent_protocol::{
    AgentId, BusCommand, BusEvent, Message, AGENT_ROUTING_PATTERN, SERVER_ROUTING_KEY,
};
use gridagent_telemetry::{log_bus_error, log_delivery_dropped, MetricsRegistry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::{BusClient, BusMessage, Subscription};
use crate::error::{BusError, CommandError, DeliveryError};
use crate::registry::{DeliveryPolicy, Registry, SessionHandle};
use crate::software::SoftwareStore;

/// Lowest protocol version that can carry software images.
const SOFTWARE_MIN_VERSION: u32 = 3;

/// An agent lane with nothing to do for this long shuts down.
const LANE_IDLE: Duration = Duration::from_secs(60);

struct Lane {
    tx: mpsc::UnboundedSender<BusMessage>,
    task: JoinHandle<()>,
}

/// Routes bus commands to agent sessions.
#[derive(Clone)]
pub struct Bridge {
    registry: Arc<Registry>,
    bus: BusClient,
    software: SoftwareStore,
    metrics: Arc<MetricsRegistry>,
    delivery_timeout: Duration,
}

impl Bridge {
    pub fn new(
        registry: Arc<Registry>,
        bus: BusClient,
        software: SoftwareStore,
        metrics: Arc<MetricsRegistry>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            software,
            metrics,
            delivery_timeout,
        }
    }

    /// Subscribe, then process commands in a background task until
    /// `shutdown` turns true or the bus goes away.
    pub async fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<Result<(), BusError>>, BusError> {
        let server = self.bus.subscribe(SERVER_ROUTING_KEY).await?;
        let agents = self.bus.subscribe(AGENT_ROUTING_PATTERN).await?;
        tracing::info!(
            subjects = ?[SERVER_ROUTING_KEY, AGENT_ROUTING_PATTERN],
            "bus bridge subscribed"
        );
        Ok(tokio::spawn(self.run(server, agents, shutdown)))
    }

    async fn run(
        self,
        mut server: Subscription,
        mut agents: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        let mut lanes = HashMap::new();
        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("bus bridge stopping");
                        return Ok(());
                    }
                    continue;
                }
                message = server.next() => message,
                message = agents.next() => message,
            };

            let Some(message) = message else {
                log_bus_error!("bus subscription ended");
                return Err(BusError::Closed);
            };
            match lane_agent(&message) {
                Some(agent) => self.route_to_lane(&mut lanes, agent, message),
                None => self.handle(message).await,
            }
        }
    }

    fn route_to_lane(&self, lanes: &mut HashMap<AgentId, Lane>, agent: AgentId, message: BusMessage) {
        let message = match lanes.get(&agent) {
            Some(lane) => match lane.tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        // the old lane went idle; the new one starts once it has drained
        let previous = lanes.remove(&agent).map(|lane| lane.task);
        lanes.retain(|_, lane| !lane.tx.is_closed());

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(message);
        let task = tokio::spawn(self.clone().run_lane(rx, previous));
        lanes.insert(agent, Lane { tx, task });
    }

    async fn run_lane(
        self,
        mut rx: mpsc::UnboundedReceiver<BusMessage>,
        previous: Option<JoinHandle<()>>,
    ) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        loop {
            match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => return,
                Err(_) => {
                    rx.close();
                    while let Ok(message) = rx.try_recv() {
                        self.handle(message).await;
                    }
                    return;
                }
            }
        }
    }

    /// Process one bus message, logging rather than returning failures.
    pub async fn handle(&self, message: BusMessage) {
        match self.dispatch(&message).await {
            Ok(()) => {}
            Err(CommandError::Delivery(e)) => {
                self.metrics.record_delivery_dropped(e.reason());
                log_delivery_dropped!(
                    subject = %message.subject,
                    reason = e.reason(),
                    error = %e,
                    "bus command dropped"
                );
            }
            Err(CommandError::Bus(e)) => {
                self.metrics.record_bus_publish_failure();
                log_bus_error!(subject = %message.subject, error = %e, "failed to answer bus command");
            }
            Err(e) => {
                tracing::warn!(subject = %message.subject, error = %e, "rejected bus command");
            }
        }
    }

    async fn dispatch(&self, message: &BusMessage) -> Result<(), CommandError> {
        let Some(command) = BusCommand::from_payload(&message.payload)? else {
            tracing::trace!(subject = %message.subject, "ignoring non-command payload");
            return Ok(());
        };
        tracing::debug!(command = command.name(), subject = %message.subject, "handling bus command");

        if let Some(agent) = command.agent() {
            if message.subject != SERVER_ROUTING_KEY && message.subject != agent.routing_key() {
                return Err(CommandError::WrongRoutingKey {
                    agent,
                    subject: message.subject.clone(),
                });
            }
        }

        match command {
            BusCommand::CurrentAgents => self.current_agents(message.reply.as_deref()).await,
            BusCommand::RelayState {
                agent,
                relay_on,
                meters,
            } => {
                let handle = self.session(agent)?;
                for meter in meters {
                    self.deliver(&handle, CommandGpSwitchRelay { meter, relay_on }.into())
                        .await?;
                }
                Ok(())
            }
            BusCommand::ControlMode {
                agent,
                control_manual,
                meters,
            } => {
                let handle = self.session(agent)?;
                for meter in meters {
                    let message = CommandGpSwitchControl {
                        meter,
                        control_manual,
                    };
                    self.deliver(&handle, message.into()).await?;
                }
                Ok(())
            }
            BusCommand::GridagentRules { agent, rulesets } => {
                let handle = self.session(agent)?;
                self.deliver(&handle, ConfigGaRulesets { rulesets }.into())
                    .await
            }
            BusCommand::GridagentSoftware {
                agent,
                sw_version,
                hw_model,
                target_hw_version,
            } => {
                let handle = self.software_session(agent, "ConfigGaSoftware")?;
                let image = self
                    .software
                    .load(hw_model, &target_hw_version, &sw_version)
                    .await?;
                tracing::info!(
                    agent = %agent,
                    sw_version = %sw_version,
                    hw_model,
                    target_hw_version = %target_hw_version,
                    size = image.len(),
                    "sending agent software"
                );
                let message = ConfigGaSoftware {
                    sw_version,
                    hw_model,
                    target_hw_version,
                    image,
                };
                self.deliver(&handle, message.into()).await
            }
            BusCommand::GridpointSoftware {
                agent,
                sw_version,
                hw_model,
                target_hw_version,
                meters,
            } => {
                let handle = self.software_session(agent, "ConfigGpSoftware")?;
                let image = self
                    .software
                    .load(hw_model, &target_hw_version, &sw_version)
                    .await?;
                tracing::info!(
                    agent = %agent,
                    sw_version = %sw_version,
                    hw_model,
                    target_hw_version = %target_hw_version,
                    meters = meters.len(),
                    size = image.len(),
                    "sending meter software"
                );
                let message = ConfigGpSoftware {
                    sw_version,
                    hw_model,
                    target_hw_version,
                    meters,
                    image,
                };
                self.deliver(&handle, message.into()).await
            }
        }
    }

    fn session(&self, agent: AgentId) -> Result<SessionHandle, CommandError> {
        self.registry
            .get(agent)
            .ok_or(CommandError::Delivery(DeliveryError::NoSession(agent)))
    }

    fn software_session(
        &self,
        agent: AgentId,
        message: &'static str,
    ) -> Result<SessionHandle, CommandError> {
        let handle = self.session(agent)?;
        let version = handle.info().protocol_version;
        if version < SOFTWARE_MIN_VERSION {
            return Err(CommandError::NotSupported {
                agent,
                message,
                version,
            });
        }
        Ok(handle)
    }

    async fn deliver(&self, handle: &SessionHandle, message: Message) -> Result<(), CommandError> {
        handle
            .deliver(message, DeliveryPolicy::Block(self.delivery_timeout))
            .await
            .map_err(CommandError::from)
    }

    async fn current_agents(&self, reply: Option<&str>) -> Result<(), CommandError> {
        let agents = self.registry.list();
        tracing::info!(count = agents.len(), "connected agents");
        for summary in &agents {
            tracing::info!(
                agent = %summary.agent,
                serial = summary.serial,
                sw_version = ?summary.sw_version,
                hw_revision = ?summary.hw_revision,
                "connected agent"
            );
        }

        let event = BusEvent::CurrentAgents { agents };
        self.bus.publish_json(&event.routing_key(), &event).await?;
        if let Some(reply) = reply {
            self.bus.publish_json(reply, &event).await?;
        }
        Ok(())
    }
}

/// Agent a command payload targets, if it parses as one.
fn lane_agent(message: &BusMessage) -> Option<AgentId> {
    BusCommand::from_payload(&message.payload)
        .ok()
        .flatten()
        .and_then(|command| command.agent())
}
