//! The agent aggregate.
//!
//! An [`Agent`] owns a mission slice: its step list, conversation history,
//! reflection bookkeeping, and handles to the external collaborators. The run
//! loop lives in [`crate::scheduler`], lifecycle operations in
//! [`crate::lifecycle`], and delegation in [`crate::delegation`], all as
//! `impl Agent` blocks over the same shared state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use troupe_kernel::agent::{
    AgentSnapshot, AgentState, AgentStatistics, ConversationTurn,
};
use troupe_kernel::config::AgentConfig;
use troupe_kernel::error::{KernelError, KernelResult};
use troupe_kernel::event::WorkProduct;
use troupe_kernel::message::{ConflictKind, InboundMessage, OutboundMessage};
use troupe_kernel::plan::PlanDescription;
use troupe_kernel::services::{
    AgentInfo, DynAgentDirectory, DynCapabilityService, DynFileStore, DynMessageBus,
    DynPersistenceService, DynReasoningService, DynTrafficControl, DynUserGateway, ReasonRequest,
};
use troupe_kernel::step::{InputSource, OutputRecord, Step, StepStatus, verb};

use crate::assembler::{self, AssemblyContext};
use crate::publisher::StatusPublisher;
use crate::reflection::ReflectionState;
use crate::remote::CrossAgentResolver;

/// Handles to every external collaborator the core consumes.
#[derive(Clone)]
pub struct AgentServices {
    pub capability: DynCapabilityService,
    pub reasoning: DynReasoningService,
    pub persistence: DynPersistenceService,
    pub bus: DynMessageBus,
    pub traffic: DynTrafficControl,
    pub gateway: DynUserGateway,
    pub directory: DynAgentDirectory,
    pub files: DynFileStore,
}

pub(crate) struct AgentInner {
    pub id: Uuid,
    pub mission_id: Uuid,
    pub role: String,
    pub host: String,
    pub config: AgentConfig,
    pub services: AgentServices,
    pub publisher: StatusPublisher,
    pub cross_agent: CrossAgentResolver,

    pub state: RwLock<AgentState>,
    pub steps: RwLock<Vec<Step>>,
    pub conversation: RwLock<Vec<ConversationTurn>>,
    pub reflection: Mutex<ReflectionState>,
    /// Cancellation scope shared by every in-flight operation. Revoked on
    /// pause/abort; a fresh token is acquired on resume.
    pub cancel: Mutex<CancellationToken>,
    /// Outstanding user questions: request id → waiting step.
    pub pending_questions: Mutex<HashMap<Uuid, Uuid>>,
    /// Steps handed to other agents: task id → local mirror in
    /// `SubPlanRunning`, re-adopted when the task result arrives.
    pub pending_delegations: Mutex<HashMap<Uuid, Step>>,
    /// Steps accepted from other agents: step id → (task id, delegator).
    pub delegated_inbound: Mutex<HashMap<Uuid, (Uuid, Uuid)>>,
    pub checkpoint_task: Mutex<Option<JoinHandle<()>>>,
    /// Final mission output, set on completion.
    pub output: RwLock<Option<WorkProduct>>,
}

/// A supervised mission worker. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(
        mission_id: Uuid,
        role: impl Into<String>,
        config: AgentConfig,
        services: AgentServices,
    ) -> Self {
        let id = Uuid::new_v4();
        let role = role.into();
        let publisher = StatusPublisher::new(
            mission_id,
            id,
            role.clone(),
            services.bus.clone(),
            services.traffic.clone(),
            services.persistence.clone(),
        );
        let cross_agent = CrossAgentResolver::new(services.directory.clone(), "local");
        Self {
            inner: Arc::new(AgentInner {
                id,
                mission_id,
                role,
                host: "local".into(),
                config,
                services,
                publisher,
                cross_agent,
                state: RwLock::new(AgentState::Initializing),
                steps: RwLock::new(Vec::new()),
                conversation: RwLock::new(Vec::new()),
                reflection: Mutex::new(ReflectionState::new()),
                cancel: Mutex::new(CancellationToken::new()),
                pending_questions: Mutex::new(HashMap::new()),
                pending_delegations: Mutex::new(HashMap::new()),
                delegated_inbound: Mutex::new(HashMap::new()),
                checkpoint_task: Mutex::new(None),
                output: RwLock::new(None),
            }),
        }
    }

    /// Restore an agent from a persisted snapshot. The agent resumes in
    /// `Initializing`; call [`Agent::resume`](crate::lifecycle) to re-enter
    /// the run loop.
    pub fn from_snapshot(snapshot: AgentSnapshot, services: AgentServices) -> Self {
        let publisher = StatusPublisher::new(
            snapshot.mission_id,
            snapshot.agent_id,
            snapshot.role.clone(),
            services.bus.clone(),
            services.traffic.clone(),
            services.persistence.clone(),
        );
        let cross_agent = CrossAgentResolver::new(services.directory.clone(), "local");
        let mut reflection = ReflectionState::new();
        reflection.reflection_done = snapshot.reflection_done;
        reflection.replan_depth = snapshot.replan_depth;
        Self {
            inner: Arc::new(AgentInner {
                id: snapshot.agent_id,
                mission_id: snapshot.mission_id,
                role: snapshot.role,
                host: "local".into(),
                config: snapshot.config,
                services,
                publisher,
                cross_agent,
                state: RwLock::new(AgentState::Initializing),
                steps: RwLock::new(snapshot.steps),
                conversation: RwLock::new(snapshot.conversation),
                reflection: Mutex::new(reflection),
                cancel: Mutex::new(CancellationToken::new()),
                pending_questions: Mutex::new(HashMap::new()),
                pending_delegations: Mutex::new(HashMap::new()),
                delegated_inbound: Mutex::new(HashMap::new()),
                checkpoint_task: Mutex::new(None),
                output: RwLock::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn mission_id(&self) -> Uuid {
        self.inner.mission_id
    }

    pub fn role(&self) -> &str {
        &self.inner.role
    }

    /// Seed the root `ACCOMPLISH` step for a mission goal.
    pub async fn seed_goal(&self, goal: impl Into<String>) -> Uuid {
        let goal = goal.into();
        let step = Step::new(self.inner.mission_id, self.inner.id, verb::ACCOMPLISH)
            .with_description(goal.clone())
            .with_input("goal", InputSource::literal(serde_json::json!(goal)));
        let id = step.id;
        self.push_steps(vec![step]).await;
        id
    }

    /// Register this agent (and its existing steps) with the directory.
    pub async fn register(&self) -> KernelResult<()> {
        let state = *self.inner.state.read().await;
        self.inner
            .services
            .directory
            .register_agent(AgentInfo {
                agent_id: self.inner.id,
                mission_id: self.inner.mission_id,
                role: self.inner.role.clone(),
                state,
                host: self.inner.host.clone(),
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Operator surface
    // -----------------------------------------------------------------------

    pub async fn state(&self) -> AgentState {
        *self.inner.state.read().await
    }

    pub async fn statistics(&self) -> AgentStatistics {
        let steps = self.inner.steps.read().await.clone();
        let total_replans = self.inner.reflection.lock().await.total_replans;
        AgentStatistics::from_steps(&steps, total_replans)
    }

    /// The final mission output, available once the agent completes.
    pub async fn output(&self) -> Option<WorkProduct> {
        self.inner.output.read().await.clone()
    }

    /// A snapshot copy of the current step list.
    pub async fn steps(&self) -> Vec<Step> {
        self.inner.steps.read().await.clone()
    }

    pub async fn step(&self, step_id: Uuid) -> Option<Step> {
        self.inner
            .steps
            .read()
            .await
            .iter()
            .find(|s| s.id == step_id)
            .cloned()
    }

    pub async fn conversation(&self) -> Vec<ConversationTurn> {
        self.inner.conversation.read().await.clone()
    }

    /// Clear bulky in-memory payloads of completed steps nothing active
    /// depends on any more. The persisted work-products keep the full data;
    /// dependents that appear later re-hydrate from there. Pruning is an
    /// explicit memory-pressure operation, never run implicitly, and skips
    /// steps that may still feed an aggregation scope.
    pub async fn prune_terminal_steps(&self) -> usize {
        let mut steps = self.inner.steps.write().await;
        let snapshot = steps.clone();
        if snapshot
            .iter()
            .any(|s| s.verb == verb::REGROUP && !s.status.is_terminal())
        {
            return 0;
        }
        let latest_completed = snapshot
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .max_by_key(|s| s.updated_at)
            .map(|s| s.id);

        let mut pruned = 0;
        for step in steps.iter_mut() {
            if step.status != StepStatus::Completed
                || Some(step.id) == latest_completed
                || step.result.iter().all(|r| r.result.is_null())
            {
                continue;
            }
            let has_active_dependent = snapshot.iter().any(|other| {
                !other.status.is_terminal()
                    && other
                        .dependencies
                        .iter()
                        .any(|d| d.source_step.step_id() == Some(step.id))
            });
            if !has_active_dependent {
                step.prune();
                pruned += 1;
            }
        }
        pruned
    }

    /// Resolve a waiting step directly with a user-supplied answer,
    /// bypassing the request-id correlation (operator surface).
    pub async fn resume_step_with_user_input(
        &self,
        step_id: Uuid,
        answer: serde_json::Value,
    ) -> KernelResult<()> {
        // Discard any request that was pointing at this step.
        {
            let mut questions = self.inner.pending_questions.lock().await;
            questions.retain(|_, waiting_step| *waiting_step != step_id);
        }
        self.complete_waiting_step(step_id, answer).await
    }

    // -----------------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------------

    /// Handle one inbound message. Message handling serializes with the
    /// scheduler through the shared step-list lock.
    pub async fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::UserMessage { content } => {
                self.inner
                    .conversation
                    .write()
                    .await
                    .push(ConversationTurn::user(content));
            }
            InboundMessage::KnowledgeShare { content } => {
                self.inner
                    .conversation
                    .write()
                    .await
                    .push(ConversationTurn::system(content));
            }
            InboundMessage::UserInputResponse {
                request_id,
                response,
            } => {
                let step_id = self.inner.pending_questions.lock().await.remove(&request_id);
                match step_id {
                    Some(step_id) => {
                        if let Err(e) = self.complete_waiting_step(step_id, response).await {
                            warn!(agent = %self.inner.id, step = %step_id, error = %e,
                                "failed to apply user input response");
                        }
                    }
                    None => {
                        warn!(agent = %self.inner.id, request = %request_id,
                            "user input response for unknown request");
                    }
                }
            }
            InboundMessage::TaskDelegation {
                task_id,
                from_agent,
                step,
            } => {
                self.accept_delegation(task_id, from_agent, *step).await;
            }
            InboundMessage::TaskResult {
                task_id,
                outputs,
                error,
            } => {
                self.handle_task_result(task_id, outputs, error).await;
            }
            InboundMessage::ConflictResolution { conflict_id, kind } => {
                self.handle_conflict(conflict_id, kind).await;
            }
            _ => unreachable!("InboundMessage is non_exhaustive but all variants are handled"),
        }
    }

    async fn handle_conflict(&self, conflict_id: Uuid, kind: ConflictKind) {
        match kind {
            ConflictKind::Resolution { decision } => {
                self.inner.conversation.write().await.push(ConversationTurn::system(
                    format!("conflict {conflict_id} resolved: {decision}"),
                ));
            }
            ConflictKind::VoteRequest { question, options } => {
                let vote = self.cast_vote(&question, &options).await;
                let message = OutboundMessage::ConflictVote {
                    conflict_id,
                    vote: vote.clone(),
                };
                if let Ok(payload) = serde_json::to_value(&message) {
                    let _ = self
                        .inner
                        .services
                        .bus
                        .publish(
                            troupe_kernel::message::AGENT_EVENTS_TOPIC,
                            "agent.conflict.vote",
                            payload,
                        )
                        .await;
                }
                self.inner.conversation.write().await.push(ConversationTurn::system(
                    format!("voted '{vote}' in conflict {conflict_id}: {question}"),
                ));
            }
        }
    }

    /// Ask the reasoning service to pick among the options, falling back to
    /// the first option when reasoning is unavailable.
    async fn cast_vote(&self, question: &str, options: &[String]) -> String {
        let fallback = options.first().cloned().unwrap_or_default();
        let conversation = self.inner.conversation.read().await.clone();
        let request = ReasonRequest {
            mission_id: self.inner.mission_id,
            agent_id: self.inner.id,
            step_id: Uuid::new_v4(),
            verb: verb::THINK.to_string(),
            inputs: HashMap::from([
                ("question".to_string(), serde_json::json!(question)),
                ("options".to_string(), serde_json::json!(options)),
            ]),
            conversation,
        };
        let cancel = self.inner.cancel.lock().await.clone();
        match self.inner.services.reasoning.reason(request, cancel).await {
            Ok(records) => records
                .iter()
                .find(|r| r.name == "answer" || r.name == "vote")
                .and_then(|r| r.result.as_str().map(|s| s.to_string()))
                .unwrap_or(fallback),
            Err(_) => fallback,
        }
    }

    // -----------------------------------------------------------------------
    // Shared internals
    // -----------------------------------------------------------------------

    /// Append freshly assembled steps, emitting creation events.
    pub(crate) async fn push_steps(&self, new_steps: Vec<Step>) {
        if new_steps.is_empty() {
            return;
        }
        {
            let mut steps = self.inner.steps.write().await;
            steps.extend(new_steps.iter().cloned());
        }
        for step in &new_steps {
            self.inner
                .publisher
                .step_event(
                    step.id,
                    troupe_kernel::event::StepEventKind::Created {
                        verb: step.verb.clone(),
                    },
                )
                .await;
        }
    }

    /// Assemble a plan under `parent` and append the steps.
    pub(crate) async fn expand_plan(
        &self,
        plan: &PlanDescription,
        parent: &Step,
        scope: Option<Uuid>,
    ) -> KernelResult<usize> {
        let assembled = {
            let steps = self.inner.steps.read().await;
            assembler::assemble(plan, &AssemblyContext::expansion(parent, scope, &steps))?
        };
        let count = assembled.len();
        self.push_steps(assembled).await;
        Ok(count)
    }

    /// Build a fresh `ACCOMPLISH` step pursuing `goal`.
    pub(crate) fn accomplish_step(&self, goal: &str) -> Step {
        Step::new(self.inner.mission_id, self.inner.id, verb::ACCOMPLISH)
            .with_description(goal.to_string())
            .with_input("goal", InputSource::literal(serde_json::json!(goal)))
    }

    /// Close a waiting step with an `answer` output.
    pub(crate) async fn complete_waiting_step(
        &self,
        step_id: Uuid,
        answer: serde_json::Value,
    ) -> KernelResult<()> {
        let records = {
            let mut steps = self.inner.steps.write().await;
            let step = steps
                .iter_mut()
                .find(|s| s.id == step_id)
                .ok_or_else(|| KernelError::Persistence(format!("step {step_id} not found")))?;
            if step.status != StepStatus::Waiting {
                return Err(KernelError::IllegalTransition {
                    step_id,
                    from: step.status.to_string(),
                    to: StepStatus::Completed.to_string(),
                });
            }

            // Cover every declared output with the answer so the completion
            // invariant holds for steps that expose it under a custom name.
            let mut records = vec![OutputRecord::new("answer", answer.clone())];
            for declared in step.outputs.keys() {
                if declared != "answer" {
                    records.push(OutputRecord::new(declared.clone(), answer.clone()));
                }
            }
            step.awaits_signal = None;
            step.complete(records.clone())?;
            records
        };

        self.after_step_completed(step_id, StepStatus::Waiting, &records)
            .await;
        info!(agent = %self.inner.id, step = %step_id, "waiting step closed by user input");
        Ok(())
    }

    /// Post-completion bookkeeping shared by the scheduler and the message
    /// handlers: events, work-product persistence, replan budget payback,
    /// and delegated-task result routing.
    pub(crate) async fn after_step_completed(
        &self,
        step_id: Uuid,
        from: StepStatus,
        records: &[OutputRecord],
    ) {
        self.inner
            .publisher
            .step_event(
                step_id,
                troupe_kernel::event::StepEventKind::StatusChanged {
                    from,
                    to: StepStatus::Completed,
                },
            )
            .await;

        let verb = self
            .step(step_id)
            .await
            .map(|s| s.verb)
            .unwrap_or_default();
        let work_product = WorkProduct::new(
            self.inner.mission_id,
            self.inner.id,
            step_id,
            verb,
            records.to_vec(),
        );
        self.inner.publisher.work_product(&work_product).await;

        self.inner.reflection.lock().await.note_success();
        self.notify_delegator_if_needed(step_id, records.to_vec(), None)
            .await;
    }

    /// If this step was accepted from another agent, route the task result
    /// back to its delegator.
    pub(crate) async fn notify_delegator_if_needed(
        &self,
        step_id: Uuid,
        outputs: Vec<OutputRecord>,
        error: Option<String>,
    ) {
        let entry = self.inner.delegated_inbound.lock().await.remove(&step_id);
        if let Some((task_id, from_agent)) = entry {
            self.inner
                .publisher
                .send_to_agent(
                    from_agent,
                    InboundMessage::TaskResult {
                        task_id,
                        outputs,
                        error,
                    },
                )
                .await;
        }
    }

    /// Summarise completed work for reflection prompts.
    pub(crate) async fn work_summary(&self) -> String {
        let steps = self.inner.steps.read().await;
        let mut lines = Vec::new();
        for step in steps.iter().filter(|s| s.status == StepStatus::Completed) {
            let outputs: Vec<String> = step
                .result
                .iter()
                .map(|r| {
                    let text = match &r.result {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let truncated: String = text.chars().take(200).collect();
                    format!("{}={}", r.name, truncated)
                })
                .collect();
            lines.push(format!("{} [{}]: {}", step.verb, step.id, outputs.join(", ")));
        }
        if lines.is_empty() {
            "no completed work yet".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// Serialize the surviving plan structure for mission reflection.
    pub(crate) async fn plan_history(&self) -> serde_json::Value {
        let steps = self.inner.steps.read().await;
        serde_json::to_value(assembler::describe(&steps)).unwrap_or(serde_json::json!([]))
    }
}
