//! Events, work-products, and user-visible messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentState, AgentStatistics};
use crate::error::ErrorClass;
use crate::step::{OutputRecord, StepStatus};

// ---------------------------------------------------------------------------
// Step events
// ---------------------------------------------------------------------------

/// Structured event describing one observable step transition. Every step
/// creation, status change, and work-product save emits one of these to the
/// persistence service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub mission_id: Uuid,
    pub agent_id: Uuid,
    pub step_id: Uuid,
    pub kind: StepEventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StepEventKind {
    Created { verb: String },
    StatusChanged { from: StepStatus, to: StepStatus },
    Retried { attempt: u32, backoff_ms: u64 },
    Failed { class: ErrorClass, message: String },
    WorkProductSaved,
    Delegated { to_agent: Uuid, transfer_id: Uuid },
}

impl StepEvent {
    pub fn new(mission_id: Uuid, agent_id: Uuid, step_id: Uuid, kind: StepEventKind) -> Self {
        Self {
            mission_id,
            agent_id,
            step_id,
            kind,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent status events
// ---------------------------------------------------------------------------

/// Published on every agent lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusEvent {
    pub mission_id: Uuid,
    pub agent_id: Uuid,
    pub role: String,
    pub state: AgentState,
    pub statistics: AgentStatistics,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Work products
// ---------------------------------------------------------------------------

/// The persisted outputs of a completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkProduct {
    pub mission_id: Uuid,
    pub agent_id: Uuid,
    pub step_id: Uuid,
    pub verb: String,
    pub outputs: Vec<OutputRecord>,
    /// File metadata attached when a deliverable was uploaded.
    #[serde(default)]
    pub attachments: Vec<FileAttachment>,
    pub saved_at: DateTime<Utc>,
}

impl WorkProduct {
    pub fn new(
        mission_id: Uuid,
        agent_id: Uuid,
        step_id: Uuid,
        verb: impl Into<String>,
        outputs: Vec<OutputRecord>,
    ) -> Self {
        Self {
            mission_id,
            agent_id,
            step_id,
            verb: verb.into(),
            outputs,
            attachments: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    /// Whether any output is explicitly marked as a deliverable.
    pub fn has_deliverable(&self) -> bool {
        self.outputs.iter().any(|o| o.is_deliverable)
    }
}

/// Metadata of an uploaded deliverable file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: Uuid,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    pub storage_path: String,
    pub uploaded_by: Uuid,
    pub uploaded_at: DateTime<Utc>,
    pub step_id: Uuid,
    pub is_deliverable: bool,
}

// ---------------------------------------------------------------------------
// User-visible messages
// ---------------------------------------------------------------------------

/// Category of a user-visible progress message. One is emitted per failure
/// category transition and at mission end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SayCategory {
    Retrying,
    Replanning,
    AbortingBranch,
    MissionFailed,
    MissionAccomplished,
    /// Infinite-loop detection fired (signature repetition, same-verb
    /// failures, or replan depth cap).
    Unrecoverable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SayMessage {
    pub mission_id: Uuid,
    pub agent_id: Uuid,
    pub category: SayCategory,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl SayMessage {
    pub fn new(
        mission_id: Uuid,
        agent_id: Uuid,
        category: SayCategory,
        text: impl Into<String>,
    ) -> Self {
        Self {
            mission_id,
            agent_id,
            category,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}
