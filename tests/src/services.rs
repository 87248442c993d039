//! Mock implementations of the kernel service contracts.
//!
//! Each mock records the calls made to it and can be scripted with
//! predefined outcomes, consumed in order (the last entry repeats).

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use troupe_kernel::agent::AgentState;
use troupe_kernel::error::{KernelError, KernelResult};
use troupe_kernel::event::{AgentStatusEvent, FileAttachment};
use troupe_kernel::services::{
    AgentDirectory, AgentInfo, CapabilityCall, CapabilityService, FileStore, ReasonRequest,
    ReasoningService, StepLocation, TrafficControl, UploadRequest, UserGateway, UserQuestion,
};
use troupe_kernel::step::OutputRecord;

/// One scripted service response.
#[derive(Clone)]
pub struct Scripted {
    pub result: Result<Vec<OutputRecord>, String>,
    /// Simulated execution latency.
    pub delay_ms: u64,
}

impl Scripted {
    pub fn ok(records: Vec<OutputRecord>) -> Self {
        Self {
            result: Ok(records),
            delay_ms: 0,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            delay_ms: 0,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

fn pop_script(queue: &mut VecDeque<Scripted>) -> Option<Scripted> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

// ---------------------------------------------------------------------------
// Capability service
// ---------------------------------------------------------------------------

/// Capability mock: scripted outcomes per verb, with call history.
///
/// Verbs without a script echo their `item` input (or the whole input map)
/// under an `echoed` output.
#[derive(Default)]
pub struct MockCapability {
    scripts: RwLock<HashMap<String, VecDeque<Scripted>>>,
    pub calls: RwLock<Vec<CapabilityCall>>,
}

impl MockCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, verb: &str, outcomes: Vec<Scripted>) {
        self.scripts
            .write()
            .await
            .insert(verb.to_string(), outcomes.into());
    }

    pub async fn call_count(&self, verb: &str) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.verb == verb)
            .count()
    }
}

#[async_trait]
impl CapabilityService for MockCapability {
    async fn execute(
        &self,
        call: CapabilityCall,
        cancel: CancellationToken,
    ) -> KernelResult<Vec<OutputRecord>> {
        self.calls.write().await.push(call.clone());

        let scripted = pop_script(
            self.scripts
                .write()
                .await
                .entry(call.verb.clone())
                .or_default(),
        );
        let Some(scripted) = scripted else {
            // Default behavior: echo.
            let echoed = call
                .inputs
                .get("item")
                .cloned()
                .unwrap_or_else(|| json!(call.inputs));
            return Ok(vec![OutputRecord::new("echoed", echoed)]);
        };

        if scripted.delay_ms > 0 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(KernelError::service("capability", "execution cancelled"));
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(scripted.delay_ms)) => {}
            }
        }
        scripted
            .result
            .map_err(|message| KernelError::service("capability", message))
    }
}

// ---------------------------------------------------------------------------
// Reasoning service
// ---------------------------------------------------------------------------

/// Reasoning mock: scripted outcomes per verb (with a separate queue for
/// failure-phase reflection). Unscripted mission reflection reports an empty
/// plan, which means "mission accomplished".
#[derive(Default)]
pub struct MockReasoner {
    scripts: RwLock<HashMap<String, VecDeque<Scripted>>>,
    pub calls: RwLock<Vec<ReasonRequest>>,
}

/// Script key for failure-phase `REFLECT` requests.
pub const FAILURE_REFLECT: &str = "REFLECT:failure";

impl MockReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, verb: &str, outcomes: Vec<Scripted>) {
        self.scripts
            .write()
            .await
            .insert(verb.to_string(), outcomes.into());
    }

    /// Number of failure-phase reflection requests observed.
    pub async fn failure_reflections(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|r| r.verb == "REFLECT" && phase_of(r) == "failure")
            .count()
    }

    pub async fn call_count(&self, verb: &str) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|r| r.verb == verb)
            .count()
    }
}

fn phase_of(request: &ReasonRequest) -> &str {
    request
        .inputs
        .get("phase")
        .and_then(|v| v.as_str())
        .unwrap_or("failure")
}

#[async_trait]
impl ReasoningService for MockReasoner {
    async fn reason(
        &self,
        request: ReasonRequest,
        _cancel: CancellationToken,
    ) -> KernelResult<Vec<OutputRecord>> {
        self.calls.write().await.push(request.clone());

        let key = if request.verb == "REFLECT" && phase_of(&request) == "failure" {
            FAILURE_REFLECT.to_string()
        } else {
            request.verb.clone()
        };
        let scripted = pop_script(self.scripts.write().await.entry(key).or_default());

        match scripted {
            Some(scripted) => scripted
                .result
                .map_err(|message| KernelError::service("reasoning", message)),
            // Unscripted reflection: nothing more to do.
            None if request.verb == "REFLECT" => Ok(vec![OutputRecord::plan("plan", json!([]))]),
            None => Ok(vec![OutputRecord::new("answer", json!("ok"))]),
        }
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// In-memory agent and step-location registry.
#[derive(Default)]
pub struct InMemoryDirectory {
    agents: DashMap<Uuid, AgentInfo>,
    locations: DashMap<Uuid, StepLocation>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_agent_state(&self, agent_id: Uuid, state: AgentState) {
        if let Some(mut info) = self.agents.get_mut(&agent_id) {
            info.state = state;
        }
    }

    pub fn location(&self, step_id: Uuid) -> Option<StepLocation> {
        self.locations.get(&step_id).map(|l| l.clone())
    }
}

#[async_trait]
impl AgentDirectory for InMemoryDirectory {
    async fn find_agent(&self, mission_id: Uuid, role: &str) -> KernelResult<Option<AgentInfo>> {
        let mut candidates: Vec<AgentInfo> = self
            .agents
            .iter()
            .filter(|entry| entry.mission_id == mission_id && entry.role == role)
            .map(|entry| entry.clone())
            .collect();
        // Prefer running agents.
        candidates.sort_by_key(|info| info.state != AgentState::Running);
        Ok(candidates.into_iter().next())
    }

    async fn request_agent(&self, mission_id: Uuid, role: &str) -> KernelResult<AgentInfo> {
        let info = AgentInfo {
            agent_id: Uuid::new_v4(),
            mission_id,
            role: role.to_string(),
            state: AgentState::Running,
            host: "local".into(),
        };
        self.agents.insert(info.agent_id, info.clone());
        Ok(info)
    }

    async fn agent_info(&self, agent_id: Uuid) -> KernelResult<Option<AgentInfo>> {
        Ok(self.agents.get(&agent_id).map(|info| info.clone()))
    }

    async fn register_agent(&self, info: AgentInfo) -> KernelResult<()> {
        self.agents.insert(info.agent_id, info);
        Ok(())
    }

    async fn step_location(&self, step_id: Uuid) -> KernelResult<Option<StepLocation>> {
        Ok(self.locations.get(&step_id).map(|l| l.clone()))
    }

    async fn update_step_location(
        &self,
        step_id: Uuid,
        location: StepLocation,
    ) -> KernelResult<()> {
        self.locations.insert(step_id, location);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway, traffic control, file store
// ---------------------------------------------------------------------------

/// Records every question asked of the user.
#[derive(Default)]
pub struct RecordingGateway {
    pub questions: RwLock<Vec<UserQuestion>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserGateway for RecordingGateway {
    async fn ask(&self, question: UserQuestion) -> KernelResult<()> {
        self.questions.write().await.push(question);
        Ok(())
    }
}

/// Records every status notification.
#[derive(Default)]
pub struct RecordingTraffic {
    pub events: RwLock<Vec<AgentStatusEvent>>,
}

impl RecordingTraffic {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn states(&self) -> Vec<AgentState> {
        self.events.read().await.iter().map(|e| e.state).collect()
    }
}

#[async_trait]
impl TrafficControl for RecordingTraffic {
    async fn notify(&self, event: &AgentStatusEvent) -> KernelResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// Pretend file store: uploads succeed and are recorded.
#[derive(Default)]
pub struct RecordingFileStore {
    pub uploads: RwLock<Vec<UploadRequest>>,
}

impl RecordingFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for RecordingFileStore {
    async fn upload(&self, request: UploadRequest) -> KernelResult<FileAttachment> {
        let attachment = FileAttachment {
            id: Uuid::new_v4(),
            original_name: request.original_name.clone(),
            mime_type: request.mime_type.clone(),
            size: request.payload.to_string().len() as u64,
            storage_path: format!("/store/{}", request.original_name),
            uploaded_by: request.uploaded_by,
            uploaded_at: chrono::Utc::now(),
            step_id: request.step_id,
            is_deliverable: request.is_deliverable,
        };
        self.uploads.write().await.push(request);
        Ok(attachment)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

use troupe_runtime::{Agent, AgentServices, InMemoryPersistence, LocalMessageBus};

/// Everything a scenario needs: one bus, one store, one registry, and the
/// scripted collaborators.
pub struct TestHarness {
    pub bus: Arc<LocalMessageBus>,
    pub persistence: Arc<InMemoryPersistence>,
    pub capability: Arc<MockCapability>,
    pub reasoner: Arc<MockReasoner>,
    pub directory: Arc<InMemoryDirectory>,
    pub gateway: Arc<RecordingGateway>,
    pub traffic: Arc<RecordingTraffic>,
    pub files: Arc<RecordingFileStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(LocalMessageBus::default()),
            persistence: Arc::new(InMemoryPersistence::new()),
            capability: Arc::new(MockCapability::new()),
            reasoner: Arc::new(MockReasoner::new()),
            directory: Arc::new(InMemoryDirectory::new()),
            gateway: Arc::new(RecordingGateway::new()),
            traffic: Arc::new(RecordingTraffic::new()),
            files: Arc::new(RecordingFileStore::new()),
        }
    }

    pub fn services(&self) -> AgentServices {
        AgentServices {
            capability: self.capability.clone(),
            reasoning: self.reasoner.clone(),
            persistence: self.persistence.clone(),
            bus: self.bus.clone(),
            traffic: self.traffic.clone(),
            gateway: self.gateway.clone(),
            directory: self.directory.clone(),
            files: self.files.clone(),
        }
    }

    /// Create an agent wired to the harness bus, with a pump task feeding
    /// inbound messages into its handler.
    pub fn agent(
        &self,
        mission_id: Uuid,
        role: &str,
        config: troupe_kernel::config::AgentConfig,
    ) -> Agent {
        let agent = Agent::new(mission_id, role, config, self.services());
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        self.bus.register_route(agent.id(), tx);
        let pump = agent.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                pump.handle_message(message).await;
            }
        });
        agent
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Fast-timing configuration for scenario tests.
pub fn test_config() -> troupe_kernel::config::AgentConfig {
    troupe_kernel::config::AgentConfig::new()
        .with_default_backoff_ms(10)
        .with_idle_sweep_ms(5)
        .with_checkpoint_minutes(0)
}
