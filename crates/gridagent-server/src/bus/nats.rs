//! NATS bus client.

use bytes::Bytes;

use super::BusMessage;
use crate::error::BusError;

/// A connected NATS client. Clones share the connection.
#[derive(Debug, Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        tracing::info!(url = %url, "established NATS connection");

        Ok(Self { client })
    }

    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::PublishFailed(e.to_string()))
    }

    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(|e| BusError::PublishFailed(e.to_string()))
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber, BusError> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeFailed(e.to_string()))
    }

    pub fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    pub async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::PublishFailed(e.to_string()))
    }
}

pub(super) fn to_bus_message(message: async_nats::Message) -> BusMessage {
    BusMessage {
        subject: message.subject.to_string(),
        payload: message.payload,
        reply: message.reply.map(|reply| reply.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_refused() {
        let result = NatsBus::connect("nats://127.0.0.1:19999").await;
        assert!(matches!(result, Err(BusError::ConnectionFailed(_))));
    }
}
