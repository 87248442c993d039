//! Agent lifecycle state machine and snapshot types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::KernelError;
use crate::step::{Step, StepStatus};

/// Role label reserved for the coordinating agent. A coordinator bypasses
/// delegation and runs all roles locally.
pub const COORDINATOR_ROLE: &str = "coordinator";

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// Agent lifecycle state machine.
///
/// `Running` is the only state in which new step dispatch occurs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AgentState {
    #[default]
    Initializing,
    Running,
    Paused,
    Completed,
    Error,
    Aborted,
}

impl AgentState {
    pub fn can_transition_to(&self, target: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, target),
            (Initializing, Running)
                | (Initializing, Aborted)
                | (Initializing, Error)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Aborted)
                | (Paused, Aborted)
        )
    }

    pub fn transition_to(&self, target: AgentState, agent_id: Uuid) -> Result<AgentState, KernelError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(KernelError::IllegalLifecycle {
                agent_id,
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// One turn of the agent's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// `user`, `assistant`, or `system`.
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Point-in-time execution statistics, served by the operator surface and
/// included in every `AgentUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatistics {
    /// Step counts keyed by status display name.
    pub steps_by_status: HashMap<String, usize>,
    pub total_steps: usize,
    pub total_retries: u64,
    pub total_replans: u32,
    pub delegations_out: u32,
    pub delegations_in: u32,
}

impl AgentStatistics {
    /// Compute statistics from a step list.
    pub fn from_steps(steps: &[Step], total_replans: u32) -> Self {
        let mut steps_by_status: HashMap<String, usize> = HashMap::new();
        let mut total_retries = 0u64;
        let mut delegations_out = 0u32;
        for step in steps {
            *steps_by_status.entry(step.status.to_string()).or_default() += 1;
            total_retries += u64::from(step.retry_count + step.recoverable_retry_count);
            delegations_out += step.delegation_history.len() as u32;
        }
        Self {
            steps_by_status,
            total_steps: steps.len(),
            total_retries,
            total_replans,
            delegations_out,
            delegations_in: 0,
        }
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps_by_status
            .get(&status.to_string())
            .copied()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Durable snapshot of an agent, periodically checkpointed and restored on
/// resume. Covers all non-derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: Uuid,
    pub mission_id: Uuid,
    pub role: String,
    pub state: AgentState,
    pub config: AgentConfig,
    pub steps: Vec<Step>,
    pub conversation: Vec<ConversationTurn>,
    /// Whether end-of-mission reflection has already run.
    pub reflection_done: bool,
    /// Current reflective replan depth.
    pub replan_depth: u32,
    pub taken_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
