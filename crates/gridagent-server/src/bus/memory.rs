//! In-process bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::BusMessage;
use crate::error::BusError;

#[derive(Debug)]
struct Subscriber {
    pattern: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Debug, Default)]
struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_inbox: AtomicU64,
}

/// Bus that delivers within the current process. Clones share subscribers.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every live subscription whose pattern matches `subject`.
    pub fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError> {
        if subject.is_empty() || subject.contains(['*', '>']) {
            return Err(BusError::PublishFailed(format!(
                "invalid subject {subject:?}"
            )));
        }
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            reply: reply.map(str::to_string),
        };

        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in subscribers.iter() {
            if subject_matches(&subscriber.pattern, subject) {
                // a receiver dropped since retain() is pruned on the next publish
                let _ = subscriber.sender.send(message.clone());
            }
        }
        Ok(())
    }

    pub fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            sender,
        });
        receiver
    }

    pub fn new_inbox(&self) -> String {
        let n = self.inner.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("_INBOX.memory.{n}")
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.len()
    }
}

/// NATS-style subject matching.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("agentserver", "agentserver"));
        assert!(subject_matches("agent.*", "agent.3c970e1e8e4e"));
        assert!(!subject_matches("agent.*", "agent"));
        assert!(!subject_matches("agent.*", "agent.a.b"));
        assert!(!subject_matches("agent.*", "agentserver"));
        assert!(subject_matches("agent.>", "agent.a.b"));
        assert!(!subject_matches("agent.>", "agent"));
        assert!(subject_matches(">", "anything.at.all"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let bus = MemoryBus::new();
        let mut agents = bus.subscribe("agent.*");
        let mut server = bus.subscribe("agentserver");

        bus.publish("agent.0011", None, Bytes::from_static(b"{}"))
            .unwrap();
        bus.publish("agentserver", Some("_INBOX.x"), Bytes::from_static(b"[]"))
            .unwrap();

        let message = agents.recv().await.unwrap();
        assert_eq!(message.subject, "agent.0011");
        assert!(agents.try_recv().is_err());

        let message = server.recv().await.unwrap();
        assert_eq!(message.reply.as_deref(), Some("_INBOX.x"));
        assert_eq!(message.payload, Bytes::from_static(b"[]"));
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = MemoryBus::new();
        let first = bus.subscribe("a");
        let _second = bus.subscribe("b");
        assert_eq!(bus.subscriber_count(), 2);
        drop(first);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn wildcard_subjects_cannot_be_published() {
        let bus = MemoryBus::new();
        assert!(bus.publish("agent.*", None, Bytes::new()).is_err());
        assert!(bus.publish("", None, Bytes::new()).is_err());
    }

    #[test]
    fn inboxes_are_unique() {
        let bus = MemoryBus::new();
        assert_ne!(bus.new_inbox(), bus.new_inbox());
    }
}
