//! Service contracts consumed by the execution core.
//!
//! Trait definitions live here in the kernel; concrete implementations (real
//! collaborators, or the in-memory mocks in `troupe-testing`) live outside.
//! The kernel never depends on an implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentSnapshot, AgentState, ConversationTurn};
use crate::event::{AgentStatusEvent, FileAttachment, StepEvent, WorkProduct};
use crate::error::KernelResult;
use crate::message::InboundMessage;
use crate::step::{OutputRecord, Step, StepStatus};

// ---------------------------------------------------------------------------
// Capability service
// ---------------------------------------------------------------------------

/// One primitive verb invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCall {
    pub mission_id: Uuid,
    pub agent_id: Uuid,
    pub step_id: Uuid,
    pub verb: String,
    /// Resolved runtime inputs, passed opaquely; transport placement is the
    /// capability service's concern.
    pub inputs: HashMap<String, Value>,
    /// Wall-clock deadline the caller will enforce.
    pub timeout_ms: u64,
}

/// Executes primitive verbs and returns structured outputs.
///
/// Implementations must honor the cancellation token: cancellation is
/// cooperative and may interrupt long-running executions on pause/abort.
#[async_trait]
pub trait CapabilityService: Send + Sync {
    async fn execute(
        &self,
        call: CapabilityCall,
        cancel: CancellationToken,
    ) -> KernelResult<Vec<OutputRecord>>;
}

// ---------------------------------------------------------------------------
// Reasoning service
// ---------------------------------------------------------------------------

/// A prompt to the language-model service: planning, reflection, or free-form
/// reasoning, addressed by verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonRequest {
    pub mission_id: Uuid,
    pub agent_id: Uuid,
    pub step_id: Uuid,
    pub verb: String,
    pub inputs: HashMap<String, Value>,
    /// Conversation history supplied as context.
    pub conversation: Vec<ConversationTurn>,
}

/// Answers prompts and generates plans.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn reason(
        &self,
        request: ReasonRequest,
        cancel: CancellationToken,
    ) -> KernelResult<Vec<OutputRecord>>;
}

// ---------------------------------------------------------------------------
// Persistence service
// ---------------------------------------------------------------------------

/// Durable storage for snapshots, events, and work-products.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn save_snapshot(&self, snapshot: &AgentSnapshot) -> KernelResult<()>;
    async fn load_snapshot(&self, agent_id: Uuid) -> KernelResult<Option<AgentSnapshot>>;

    async fn save_step_event(&self, event: &StepEvent) -> KernelResult<()>;

    async fn save_work_product(&self, work_product: &WorkProduct) -> KernelResult<()>;
    async fn load_work_product(&self, step_id: Uuid) -> KernelResult<Option<WorkProduct>>;

    async fn load_step(&self, step_id: Uuid) -> KernelResult<Option<Step>>;

    /// All deliverable-bearing work-products of one agent.
    async fn load_deliverables(&self, agent_id: Uuid) -> KernelResult<Vec<WorkProduct>>;
}

// ---------------------------------------------------------------------------
// Message bus and traffic control
// ---------------------------------------------------------------------------

/// Topic/routing-key publish plus direct agent-to-agent routing.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, routing_key: &str, payload: Value) -> KernelResult<()>;

    /// Route a message directly to another agent's inbound queue.
    async fn send(&self, to_agent: Uuid, message: InboundMessage) -> KernelResult<()>;
}

/// The traffic-control collaborator notified directly (in addition to the
/// bus) on every agent transition.
#[async_trait]
pub trait TrafficControl: Send + Sync {
    async fn notify(&self, event: &AgentStatusEvent) -> KernelResult<()>;
}

// ---------------------------------------------------------------------------
// User gateway
// ---------------------------------------------------------------------------

/// A question posed to the user; the answer arrives later as a
/// `UserInputResponse` keyed by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuestion {
    pub mission_id: Uuid,
    pub agent_id: Uuid,
    pub step_id: Uuid,
    pub request_id: Uuid,
    pub question: String,
}

#[async_trait]
pub trait UserGateway: Send + Sync {
    async fn ask(&self, question: UserQuestion) -> KernelResult<()>;
}

// ---------------------------------------------------------------------------
// Agent directory (registry)
// ---------------------------------------------------------------------------

/// Registry view of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: Uuid,
    pub mission_id: Uuid,
    pub role: String,
    pub state: AgentState,
    /// Host address the agent is reachable on.
    pub host: String,
}

/// Registry entry mapping a step to its current owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLocation {
    pub owner_agent_id: Uuid,
    pub agent_host: String,
}

/// Registry of agents and step locations.
///
/// Each agent mutates only its own slice of the step-location mapping;
/// lookups may be cached but updates are authoritative through the registry.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Find an active agent of the given role within a mission, preferring
    /// agents in `Running`.
    async fn find_agent(&self, mission_id: Uuid, role: &str) -> KernelResult<Option<AgentInfo>>;

    /// Request creation of a role-specialised agent. The returned agent may
    /// still be initializing; callers poll [`AgentDirectory::agent_info`]
    /// until it reports `Running`.
    async fn request_agent(&self, mission_id: Uuid, role: &str) -> KernelResult<AgentInfo>;

    async fn agent_info(&self, agent_id: Uuid) -> KernelResult<Option<AgentInfo>>;

    async fn register_agent(&self, info: AgentInfo) -> KernelResult<()>;

    async fn step_location(&self, step_id: Uuid) -> KernelResult<Option<StepLocation>>;

    async fn update_step_location(&self, step_id: Uuid, location: StepLocation)
        -> KernelResult<()>;
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Upload request for a deliverable payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub original_name: String,
    pub mime_type: String,
    pub payload: Value,
    pub uploaded_by: Uuid,
    pub step_id: Uuid,
    pub is_deliverable: bool,
}

/// Shared file store for step-output deliverables.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> KernelResult<FileAttachment>;
}

// ---------------------------------------------------------------------------
// Cross-agent step views
// ---------------------------------------------------------------------------

/// Read-only view of a step owned by another agent: status and result only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub id: Uuid,
    pub status: StepStatus,
    pub result: Vec<OutputRecord>,
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            id: step.id,
            status: step.status,
            result: step.result.clone(),
        }
    }
}

/// Host-local access to live steps of co-located agents, used by the
/// cross-agent resolver's fast path. Reads only.
#[async_trait]
pub trait LocalStepAccess: Send + Sync {
    async fn step_view(&self, agent_id: Uuid, step_id: Uuid) -> Option<StepView>;
}

// ---------------------------------------------------------------------------
// Dynamic service handles
// ---------------------------------------------------------------------------

pub type DynCapabilityService = Arc<dyn CapabilityService>;
pub type DynReasoningService = Arc<dyn ReasoningService>;
pub type DynPersistenceService = Arc<dyn PersistenceService>;
pub type DynMessageBus = Arc<dyn MessageBus>;
pub type DynTrafficControl = Arc<dyn TrafficControl>;
pub type DynUserGateway = Arc<dyn UserGateway>;
pub type DynAgentDirectory = Arc<dyn AgentDirectory>;
pub type DynFileStore = Arc<dyn FileStore>;
pub type DynLocalStepAccess = Arc<dyn LocalStepAccess>;
