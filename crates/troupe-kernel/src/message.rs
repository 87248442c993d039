//! Inbound and outbound agent messages.
//!
//! Inbound messages arrive through the message bus and serialize with the
//! scheduler; outbound messages are published on the bus topic and mirrored to
//! the traffic-control collaborator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{AgentState, AgentStatistics};
use crate::event::WorkProduct;
use crate::step::{OutputRecord, Step};

/// Bus topic on which agent events are published.
pub const AGENT_EVENTS_TOPIC: &str = "agent.events";
/// Routing key for agent status updates.
pub const STATUS_UPDATE_KEY: &str = "agent.status.update";
/// Routing key for user-visible say messages.
pub const SAY_KEY: &str = "agent.say";
/// Routing key for work-product updates.
pub const WORK_PRODUCT_KEY: &str = "agent.work_product";
/// Routing key for uncovered step failures.
pub const STEP_FAILURE_KEY: &str = "agent.step_failure";

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Messages an agent handles from the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum InboundMessage {
    /// Free-form user message, appended to the conversation.
    UserMessage { content: String },
    /// Answer to a previously asked question; closes the matching `Waiting`
    /// step with an `answer` output.
    UserInputResponse { request_id: Uuid, response: Value },
    /// Request to accept a delegated step.
    TaskDelegation {
        task_id: Uuid,
        from_agent: Uuid,
        step: Box<Step>,
    },
    /// Completion signal for a previously delegated task.
    TaskResult {
        task_id: Uuid,
        outputs: Vec<OutputRecord>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Shared knowledge, appended to the conversation as a system message.
    KnowledgeShare { content: String },
    /// Conflict resolution: either a final decision or a vote request.
    ConflictResolution {
        conflict_id: Uuid,
        #[serde(flatten)]
        kind: ConflictKind,
    },
}

/// The two shapes a conflict-resolution message takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// A final resolution to record.
    Resolution { decision: String },
    /// A request for this agent's vote among the options.
    VoteRequest { question: String, options: Vec<String> },
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Messages an agent publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum OutboundMessage {
    /// Status + statistics, sent on every lifecycle transition.
    AgentUpdate {
        agent_id: Uuid,
        mission_id: Uuid,
        state: AgentState,
        statistics: AgentStatistics,
    },
    /// A step produced a work-product visible to the user.
    WorkProductUpdate { work_product: Box<WorkProduct> },
    /// A failure nothing could recover from.
    StepFailure {
        agent_id: Uuid,
        step_id: Uuid,
        verb: String,
        message: String,
    },
    /// Response to a delegated task, routed back to the delegator.
    TaskResult {
        task_id: Uuid,
        to_agent: Uuid,
        outputs: Vec<OutputRecord>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// This agent's vote in a conflict resolution round.
    ConflictVote { conflict_id: Uuid, vote: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn inbound_tagging() {
        let msg = InboundMessage::UserInputResponse {
            request_id: Uuid::new_v4(),
            response: json!("yes"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "USER_INPUT_RESPONSE");
    }

    #[test]
    fn conflict_kinds_round_trip() {
        let msg = InboundMessage::ConflictResolution {
            conflict_id: Uuid::new_v4(),
            kind: ConflictKind::VoteRequest {
                question: "which plan?".into(),
                options: vec!["a".into(), "b".into()],
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        match back {
            InboundMessage::ConflictResolution {
                kind: ConflictKind::VoteRequest { options, .. },
                ..
            } => assert_eq!(options.len(), 2),
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn task_result_omits_absent_error() {
        let msg = OutboundMessage::TaskResult {
            task_id: Uuid::new_v4(),
            to_agent: Uuid::new_v4(),
            outputs: vec![],
            error: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("error").is_none());
    }
}
