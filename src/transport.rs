// transport.rs - Transport Collaborator Contract

//! The engine does not own a wire protocol. It consumes a [`Transport`]
//! that can deliver a [`Message`] point-to-point or broadcast within a
//! shard, with at-least-once delivery from the engine's perspective.
//! Duplicate suppression is the engine's job, not the transport's.
//!
//! [`LocalBus`] is the in-process reference implementation backing the
//! tests and simulations.

use std::sync::Arc;

use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::message::Message;

/// A shard-scoped delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Recipient {
    /// A single endpoint inside a shard.
    #[display("{key}@{shard}")]
    Agent { key: String, shard: String },
    /// Every endpoint bound to a shard.
    #[display("*@{shard}")]
    Broadcast { shard: String },
}

impl Recipient {
    pub fn agent(key: impl Into<String>, shard: impl Into<String>) -> Self {
        Recipient::Agent {
            key: key.into(),
            shard: shard.into(),
        }
    }

    pub fn broadcast(shard: impl Into<String>) -> Self {
        Recipient::Broadcast {
            shard: shard.into(),
        }
    }

    pub fn shard(&self) -> &str {
        match self {
            Recipient::Agent { shard, .. } | Recipient::Broadcast { shard } => shard,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send called with no recipients")]
    NoRecipients,
    #[error("transport closed")]
    Closed,
}

/// Point-to-point and shard-broadcast message delivery.
pub trait Transport: Send + Sync + 'static {
    /// Deliver `message` to the given endpoints. `handover` marks a
    /// message re-addressed to a new peer mid-exchange; transports that
    /// journal traffic use it to skip re-recording.
    fn send(
        &self,
        recipients: &[Recipient],
        message: Message,
        handover: bool,
    ) -> Result<(), TransportError>;
}

/// In-memory bus: endpoints are unbounded channels keyed by (shard, key).
#[derive(Clone, Default)]
pub struct LocalBus {
    routes: Arc<DashMap<(String, String), UnboundedSender<Message>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an endpoint; the receiver is the endpoint's inbound queue.
    pub fn bind(
        &self,
        shard: impl Into<String>,
        key: impl Into<String>,
    ) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert((shard.into(), key.into()), tx);
        rx
    }

    fn deliver(&self, shard: &str, key: &str, message: Message) {
        match self.routes.get(&(shard.to_string(), key.to_string())) {
            Some(route) => {
                if route.send(message).is_err() {
                    debug!(shard, key, "endpoint gone, message dropped");
                }
            }
            None => debug!(shard, key, "no endpoint bound, message dropped"),
        }
    }
}

impl Transport for LocalBus {
    fn send(
        &self,
        recipients: &[Recipient],
        message: Message,
        handover: bool,
    ) -> Result<(), TransportError> {
        if recipients.is_empty() {
            return Err(TransportError::NoRecipients);
        }
        debug!(
            kind = message.body.kind_name(),
            protocol_id = %message.protocol_id,
            handover,
            "bus send"
        );

        for recipient in recipients {
            match recipient {
                Recipient::Agent { key, shard } => {
                    self.deliver(shard, key, message.clone());
                }
                Recipient::Broadcast { shard } => {
                    let keys: Vec<String> = self
                        .routes
                        .iter()
                        .filter(|entry| entry.key().0 == *shard)
                        .map(|entry| entry.key().1.clone())
                        .collect();
                    for key in keys {
                        self.deliver(shard, &key, message.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;

    #[tokio::test]
    async fn test_broadcast_reaches_every_shard_endpoint() {
        let bus = LocalBus::new();
        let mut a = bus.bind("shard-1", "a");
        let mut b = bus.bind("shard-1", "b");
        let mut other = bus.bind("shard-2", "c");

        bus.send(
            &[Recipient::broadcast("shard-1")],
            Message::new(Body::Notification),
            false,
        )
        .unwrap();

        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_addressing_is_point_to_point() {
        let bus = LocalBus::new();
        let mut a = bus.bind("shard-1", "a");
        let mut b = bus.bind("shard-1", "b");

        bus.send(
            &[Recipient::agent("a", "shard-1")],
            Message::new(Body::Request),
            false,
        )
        .unwrap();

        assert!(a.recv().await.is_some());
        assert!(b.try_recv().is_err());
    }
}
