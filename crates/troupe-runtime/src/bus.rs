//! In-process message bus.
//!
//! Topic publishes fan out on a broadcast channel; direct agent-to-agent
//! sends go through per-agent mpsc routes registered at agent startup. A
//! production deployment substitutes a broker-backed implementation of the
//! same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use troupe_kernel::error::{KernelError, KernelResult};
use troupe_kernel::message::InboundMessage;
use troupe_kernel::services::MessageBus;

/// A topic publish as seen by bus subscribers.
#[derive(Debug, Clone)]
pub struct BusEnvelope {
    pub topic: String,
    pub routing_key: String,
    pub payload: Value,
}

/// Broadcast-channel bus with direct per-agent routes.
pub struct LocalMessageBus {
    topic_tx: broadcast::Sender<BusEnvelope>,
    routes: DashMap<Uuid, mpsc::Sender<InboundMessage>>,
}

impl LocalMessageBus {
    pub fn new(capacity: usize) -> Self {
        let (topic_tx, _) = broadcast::channel(capacity);
        Self {
            topic_tx,
            routes: DashMap::new(),
        }
    }

    /// Subscribe to every topic publish.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.topic_tx.subscribe()
    }

    /// Register an agent's inbound queue. Replaces any previous route.
    pub fn register_route(&self, agent_id: Uuid, tx: mpsc::Sender<InboundMessage>) {
        self.routes.insert(agent_id, tx);
    }

    pub fn unregister_route(&self, agent_id: Uuid) {
        self.routes.remove(&agent_id);
    }
}

impl Default for LocalMessageBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for LocalMessageBus {
    async fn publish(&self, topic: &str, routing_key: &str, payload: Value) -> KernelResult<()> {
        // A publish with no subscribers is not an error.
        let _ = self.topic_tx.send(BusEnvelope {
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        });
        Ok(())
    }

    async fn send(&self, to_agent: Uuid, message: InboundMessage) -> KernelResult<()> {
        let tx = self
            .routes
            .get(&to_agent)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                KernelError::service("bus", format!("no route to agent {to_agent}"))
            })?;
        tx.send(message)
            .await
            .map_err(|e| KernelError::service("bus", format!("route to {to_agent} closed: {e}")))
    }
}
