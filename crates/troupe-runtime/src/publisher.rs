//! Status publishing.
//!
//! Every agent-state transition is announced twice: once on the bus topic and
//! once directly to the traffic-control collaborator. Both paths are
//! fire-and-forget; failures are logged and never propagate into execution.
//! Step events and work-products go to the persistence service.

use tracing::{debug, warn};
use uuid::Uuid;

use troupe_kernel::agent::{AgentState, AgentStatistics};
use troupe_kernel::event::{
    AgentStatusEvent, SayCategory, SayMessage, StepEvent, StepEventKind, WorkProduct,
};
use troupe_kernel::message::{
    AGENT_EVENTS_TOPIC, OutboundMessage, SAY_KEY, STATUS_UPDATE_KEY, STEP_FAILURE_KEY,
    WORK_PRODUCT_KEY,
};
use troupe_kernel::services::{DynMessageBus, DynPersistenceService, DynTrafficControl};

/// Publishes agent status, step events, and work-products.
#[derive(Clone)]
pub struct StatusPublisher {
    mission_id: Uuid,
    agent_id: Uuid,
    role: String,
    bus: DynMessageBus,
    traffic: DynTrafficControl,
    persistence: DynPersistenceService,
}

impl StatusPublisher {
    pub fn new(
        mission_id: Uuid,
        agent_id: Uuid,
        role: impl Into<String>,
        bus: DynMessageBus,
        traffic: DynTrafficControl,
        persistence: DynPersistenceService,
    ) -> Self {
        Self {
            mission_id,
            agent_id,
            role: role.into(),
            bus,
            traffic,
            persistence,
        }
    }

    /// Announce a lifecycle transition on the bus and to traffic control.
    /// Both notifications fail independently and non-fatally.
    pub async fn agent_state(&self, state: AgentState, statistics: AgentStatistics) {
        let event = AgentStatusEvent {
            mission_id: self.mission_id,
            agent_id: self.agent_id,
            role: self.role.clone(),
            state,
            statistics: statistics.clone(),
            timestamp: chrono::Utc::now(),
        };

        let update = OutboundMessage::AgentUpdate {
            agent_id: self.agent_id,
            mission_id: self.mission_id,
            state,
            statistics,
        };
        if let Ok(payload) = serde_json::to_value(&update)
            && let Err(e) = self
                .bus
                .publish(AGENT_EVENTS_TOPIC, STATUS_UPDATE_KEY, payload)
                .await
        {
            warn!(agent = %self.agent_id, error = %e, "status publish failed");
        }

        if let Err(e) = self.traffic.notify(&event).await {
            warn!(agent = %self.agent_id, error = %e, "traffic-control notify failed");
        }
    }

    /// Record a structured step event with the persistence service.
    pub async fn step_event(&self, step_id: Uuid, kind: StepEventKind) {
        let event = StepEvent::new(self.mission_id, self.agent_id, step_id, kind);
        if let Err(e) = self.persistence.save_step_event(&event).await {
            warn!(agent = %self.agent_id, step = %step_id, error = %e, "step event save failed");
        }
    }

    /// Persist a work-product and announce it to the user.
    pub async fn work_product(&self, work_product: &WorkProduct) {
        if let Err(e) = self.persistence.save_work_product(work_product).await {
            warn!(
                agent = %self.agent_id,
                step = %work_product.step_id,
                error = %e,
                "work-product save failed"
            );
            return;
        }
        self.step_event(work_product.step_id, StepEventKind::WorkProductSaved)
            .await;

        let update = OutboundMessage::WorkProductUpdate {
            work_product: Box::new(work_product.clone()),
        };
        if let Ok(payload) = serde_json::to_value(&update)
            && let Err(e) = self
                .bus
                .publish(AGENT_EVENTS_TOPIC, WORK_PRODUCT_KEY, payload)
                .await
        {
            warn!(agent = %self.agent_id, error = %e, "work-product publish failed");
        }
    }

    /// Announce an uncovered step failure.
    pub async fn step_failure(&self, step_id: Uuid, verb: &str, message: &str) {
        let update = OutboundMessage::StepFailure {
            agent_id: self.agent_id,
            step_id,
            verb: verb.to_string(),
            message: message.to_string(),
        };
        if let Ok(payload) = serde_json::to_value(&update)
            && let Err(e) = self
                .bus
                .publish(AGENT_EVENTS_TOPIC, STEP_FAILURE_KEY, payload)
                .await
        {
            warn!(agent = %self.agent_id, error = %e, "step-failure publish failed");
        }
    }

    /// Emit a user-visible progress message.
    pub async fn say(&self, category: SayCategory, text: impl Into<String>) {
        let message = SayMessage::new(self.mission_id, self.agent_id, category, text);
        debug!(agent = %self.agent_id, category = ?category, "say: {}", message.text);
        if let Ok(payload) = serde_json::to_value(&message)
            && let Err(e) = self.bus.publish(AGENT_EVENTS_TOPIC, SAY_KEY, payload).await
        {
            warn!(agent = %self.agent_id, error = %e, "say publish failed");
        }
    }

    /// Route an outbound message directly to a peer agent.
    pub async fn send_to_agent(
        &self,
        to_agent: Uuid,
        message: troupe_kernel::message::InboundMessage,
    ) {
        if let Err(e) = self.bus.send(to_agent, message).await {
            warn!(agent = %self.agent_id, peer = %to_agent, error = %e, "peer send failed");
        }
    }
}
