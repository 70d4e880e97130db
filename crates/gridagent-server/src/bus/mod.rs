//! Topic bus transport.
//!
//! Production deployments use NATS; tests and single-process setups use the
//! in-memory bus. Both follow NATS subject rules: tokens separated by `.`,
//! `*` matches one token and `>` matches the rest.

mod memory;
mod nats;

pub use memory::{subject_matches, MemoryBus};
pub use nats::NatsBus;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::BusError;

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Where the sender expects a response, if anywhere.
    pub reply: Option<String>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply: None,
        }
    }
}

/// Handle to the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub enum BusClient {
    Nats(NatsBus),
    Memory(MemoryBus),
}

impl BusClient {
    /// Connect to a bus by URL. `memory://` selects a fresh in-memory bus.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        if url.starts_with("memory://") {
            return Ok(BusClient::Memory(MemoryBus::new()));
        }
        NatsBus::connect(url).await.map(BusClient::Nats)
    }

    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        match self {
            BusClient::Nats(bus) => bus.publish(subject, payload).await,
            BusClient::Memory(bus) => bus.publish(subject, None, payload),
        }
    }

    /// Publish with a reply subject attached.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        match self {
            BusClient::Nats(bus) => bus.publish_with_reply(subject, reply, payload).await,
            BusClient::Memory(bus) => bus.publish(subject, Some(reply), payload),
        }
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| BusError::PublishFailed(e.to_string()))?;
        self.publish(subject, Bytes::from(payload)).await
    }

    pub async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        match self {
            BusClient::Nats(bus) => bus.subscribe(subject).await.map(Subscription::Nats),
            BusClient::Memory(bus) => Ok(Subscription::Memory(bus.subscribe(subject))),
        }
    }

    /// A fresh subject for replies addressed to this client.
    pub fn new_inbox(&self) -> String {
        match self {
            BusClient::Nats(bus) => bus.new_inbox(),
            BusClient::Memory(bus) => bus.new_inbox(),
        }
    }

    /// Wait until published messages have left the client.
    pub async fn flush(&self) -> Result<(), BusError> {
        match self {
            BusClient::Nats(bus) => bus.flush().await,
            BusClient::Memory(_) => Ok(()),
        }
    }
}

/// A stream of messages matching one subject pattern.
#[derive(Debug)]
pub enum Subscription {
    Nats(async_nats::Subscriber),
    Memory(mpsc::UnboundedReceiver<BusMessage>),
}

impl Subscription {
    /// The next message, or `None` once the bus connection is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        match self {
            Subscription::Nats(subscriber) => {
                use futures_util::StreamExt;
                subscriber.next().await.map(nats::to_bus_message)
            }
            Subscription::Memory(receiver) => receiver.recv().await,
        }
    }
}
