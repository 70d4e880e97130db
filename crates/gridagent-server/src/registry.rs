//! Process-wide map from agent id to live session.
//!
//! The map stores only handles used to enqueue outbound messages and to
//! signal closure. Each session is owned by its driver task, which removes
//! its entry on exit unless a newer session has already replaced it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gridagent_protocol::{AgentId, AgentSummary, Message, SoftwareVersion};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::error::{CloseReason, DeliveryError};

/// What a session's driver is told to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSignal {
    Open,
    Close(CloseReason),
}

/// How to treat a full outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Wait for space, up to the given timeout.
    Block(Duration),
    /// Drop the message immediately.
    Drop,
}

/// What the server knows about a connected agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub protocol_version: u32,
    pub peer: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub serial: u32,
    pub device_type: Option<u8>,
    pub sw_version: Option<SoftwareVersion>,
    pub hw_revision: Option<SoftwareVersion>,
}

impl AgentInfo {
    pub fn new(protocol_version: u32, peer: Option<SocketAddr>) -> Self {
        Self {
            protocol_version,
            peer,
            connected_at: Utc::now(),
            serial: 0,
            device_type: None,
            sw_version: None,
            hw_revision: None,
        }
    }
}

/// Back-reference to a live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: u64,
    agent: AgentId,
    outbound: mpsc::Sender<Message>,
    close: Arc<watch::Sender<CloseSignal>>,
    info: Arc<RwLock<AgentInfo>>,
}

impl SessionHandle {
    /// Create a handle plus the receiving ends owned by the session driver.
    pub fn new(
        session_id: u64,
        agent: AgentId,
        info: AgentInfo,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>, watch::Receiver<CloseSignal>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (close, close_rx) = watch::channel(CloseSignal::Open);
        let handle = Self {
            session_id,
            agent,
            outbound,
            close: Arc::new(close),
            info: Arc::new(RwLock::new(info)),
        };
        (handle, outbound_rx, close_rx)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// Enqueue a message for the session's writer.
    pub async fn deliver(&self, message: Message, policy: DeliveryPolicy) -> Result<(), DeliveryError> {
        if self.is_closing() {
            return Err(DeliveryError::Closed);
        }
        match policy {
            DeliveryPolicy::Drop => self.outbound.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            }),
            DeliveryPolicy::Block(timeout) => {
                match tokio::time::timeout(timeout, self.outbound.send(message)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(DeliveryError::Closed),
                    Err(_) => Err(DeliveryError::Timeout),
                }
            }
        }
    }

    /// Signal the session to close. Only the first reason sticks.
    ///
    /// Returns whether this call changed the signal.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.close.send_if_modified(|signal| {
            if *signal == CloseSignal::Open {
                *signal = CloseSignal::Close(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match *self.close.borrow() {
            CloseSignal::Open => None,
            CloseSignal::Close(reason) => Some(reason),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Another receiver for the close signal.
    pub fn close_signal(&self) -> watch::Receiver<CloseSignal> {
        self.close.subscribe()
    }

    pub fn info(&self) -> AgentInfo {
        self.info.read().clone()
    }

    pub fn update_info(&self, update: impl FnOnce(&mut AgentInfo)) {
        update(&mut self.info.write());
    }

    pub fn summary(&self) -> AgentSummary {
        let info = self.info.read();
        AgentSummary {
            agent: self.agent,
            protocol_version: info.protocol_version,
            connected_at: info.connected_at,
            peer: info.peer.map(|peer| peer.to_string()),
            serial: info.serial,
            device_type: info.device_type,
            sw_version: info.sw_version.clone(),
            hw_revision: info.hw_revision.clone(),
        }
    }
}

/// Live sessions keyed by agent id.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<AgentId, SessionHandle>,
    next_session_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id that tells sessions of the same agent apart.
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make `handle` the current session for its agent.
    ///
    /// A session already registered for the agent is told to close and
    /// returned.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let displaced = self.sessions.insert(handle.agent(), handle);
        if let Some(old) = &displaced {
            old.close(CloseReason::Displaced);
        }
        displaced
    }

    /// Remove the entry for `agent` if it still belongs to `session_id`.
    pub fn unregister(&self, agent: AgentId, session_id: u64) -> bool {
        self.sessions
            .remove_if(&agent, |_, handle| handle.session_id() == session_id)
            .is_some()
    }

    pub fn get(&self, agent: AgentId) -> Option<SessionHandle> {
        self.sessions.get(&agent).map(|entry| entry.value().clone())
    }

    /// Enqueue a message for the current session of `agent`.
    pub async fn deliver(
        &self,
        agent: AgentId,
        message: Message,
        policy: DeliveryPolicy,
    ) -> Result<(), DeliveryError> {
        // clone out of the map so no shard lock is held across the await
        let handle = self.get(agent).ok_or(DeliveryError::NoSession(agent))?;
        handle.deliver(message, policy).await
    }

    /// Summaries of all live sessions, ordered by agent id.
    pub fn list(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        agents.sort_by_key(|summary| summary.agent);
        agents
    }

    /// Signal every registered session to close.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in &handles {
            handle.close(reason);
        }
        handles.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridagent_protocol::messages::{CommandGaPollMeasurements, CommandGaPropagateTime};

    const AGENT: AgentId = AgentId::new(0x3C97_0E1E_8E4E);

    fn handle(
        registry: &Registry,
        capacity: usize,
    ) -> (SessionHandle, mpsc::Receiver<Message>, watch::Receiver<CloseSignal>) {
        SessionHandle::new(
            registry.next_session_id(),
            AGENT,
            AgentInfo::new(3, None),
            capacity,
        )
    }

    #[tokio::test]
    async fn register_then_lookup() {
        let registry = Registry::new();
        let (s1, _rx, _close) = handle(&registry, 4);
        assert!(registry.register(s1.clone()).is_none());
        assert_eq!(registry.get(AGENT).unwrap().session_id(), s1.session_id());
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(AGENT, s1.session_id()));
        assert!(registry.get(AGENT).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn displacement_closes_old_session() {
        let registry = Registry::new();
        let (s1, _rx1, mut close1) = handle(&registry, 4);
        let (s2, _rx2, close2) = handle(&registry, 4);

        registry.register(s1.clone());
        let displaced = registry.register(s2.clone()).unwrap();
        assert_eq!(displaced.session_id(), s1.session_id());
        assert_eq!(registry.get(AGENT).unwrap().session_id(), s2.session_id());

        tokio::time::timeout(Duration::from_secs(1), close1.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*close1.borrow(), CloseSignal::Close(CloseReason::Displaced));
        assert_eq!(*close2.borrow(), CloseSignal::Open);

        // the displaced session's cleanup must not remove its successor
        assert!(!registry.unregister(AGENT, s1.session_id()));
        assert_eq!(registry.get(AGENT).unwrap().session_id(), s2.session_id());
    }

    #[tokio::test]
    async fn concurrent_registration_leaves_one_session() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (h, rx, close) = SessionHandle::new(
                    registry.next_session_id(),
                    AGENT,
                    AgentInfo::new(3, None),
                    1,
                );
                registry.register(h.clone());
                (h, rx, close)
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(registry.len(), 1);
        let current = registry.get(AGENT).unwrap().session_id();
        for (h, _, _) in &handles {
            if h.session_id() == current {
                assert!(!h.is_closing());
            } else {
                assert_eq!(h.close_reason(), Some(CloseReason::Displaced));
            }
        }
    }

    #[tokio::test]
    async fn deliver_preserves_order() {
        let registry = Registry::new();
        let (s1, mut rx, _close) = handle(&registry, 4);
        registry.register(s1);

        let block = DeliveryPolicy::Block(Duration::from_secs(1));
        registry
            .deliver(AGENT, CommandGaPollMeasurements.into(), block)
            .await
            .unwrap();
        registry
            .deliver(AGENT, CommandGaPropagateTime.into(), block)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), Message::from(CommandGaPollMeasurements));
        assert_eq!(rx.recv().await.unwrap(), Message::from(CommandGaPropagateTime));
    }

    #[tokio::test]
    async fn full_queue_respects_policy() {
        let registry = Registry::new();
        let (s1, _rx, _close) = handle(&registry, 1);
        registry.register(s1);

        registry
            .deliver(AGENT, CommandGaPollMeasurements.into(), DeliveryPolicy::Drop)
            .await
            .unwrap();
        assert_eq!(
            registry
                .deliver(AGENT, CommandGaPollMeasurements.into(), DeliveryPolicy::Drop)
                .await,
            Err(DeliveryError::QueueFull)
        );
        assert_eq!(
            registry
                .deliver(
                    AGENT,
                    CommandGaPollMeasurements.into(),
                    DeliveryPolicy::Block(Duration::from_millis(20))
                )
                .await,
            Err(DeliveryError::Timeout)
        );
    }

    #[tokio::test]
    async fn deliver_to_missing_or_closing_session() {
        let registry = Registry::new();
        assert_eq!(
            registry
                .deliver(AGENT, CommandGaPollMeasurements.into(), DeliveryPolicy::Drop)
                .await,
            Err(DeliveryError::NoSession(AGENT))
        );

        let (s1, _rx, _close) = handle(&registry, 4);
        registry.register(s1.clone());
        assert!(s1.close(CloseReason::Shutdown));
        assert!(!s1.close(CloseReason::PollTimeout));
        assert_eq!(s1.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(
            registry
                .deliver(AGENT, CommandGaPollMeasurements.into(), DeliveryPolicy::Drop)
                .await,
            Err(DeliveryError::Closed)
        );
    }

    #[test]
    fn list_reports_agent_info() {
        let registry = Registry::new();
        let (s1, _rx, _close) = handle(&registry, 4);
        s1.update_info(|info| {
            info.serial = 4711;
            info.sw_version = Some(SoftwareVersion::new(2, 1, 0, ""));
        });
        registry.register(s1);

        let agents = registry.list();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent, AGENT);
        assert_eq!(agents[0].serial, 4711);
        assert_eq!(agents[0].protocol_version, 3);
        assert_eq!(agents[0].sw_version, Some(SoftwareVersion::new(2, 1, 0, "")));
    }

    #[test]
    fn close_all_signals_everyone() {
        let registry = Registry::new();
        let (s1, _rx1, _c1) = SessionHandle::new(1, AgentId::new(1), AgentInfo::new(3, None), 1);
        let (s2, _rx2, _c2) = SessionHandle::new(2, AgentId::new(2), AgentInfo::new(3, None), 1);
        registry.register(s1.clone());
        registry.register(s2.clone());
        assert_eq!(registry.close_all(CloseReason::Shutdown), 2);
        assert_eq!(s1.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(s2.close_reason(), Some(CloseReason::Shutdown));
    }
}
