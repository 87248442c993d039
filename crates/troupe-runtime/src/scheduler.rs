//! Scheduler / run loop.
//!
//! A cooperative loop tied to the agent lifecycle: sweep for ready steps,
//! dispatch them concurrently, join the batch, apply outcomes, then test for
//! deadlock and completion. The loop is logically single-threaded per agent;
//! step-list mutations happen only at the batch-join boundary or from message
//! handlers, which serialize through the same locks.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use troupe_kernel::agent::{AgentState, COORDINATOR_ROLE};
use troupe_kernel::error::{ErrorClass, ErrorSignal, KernelResult, code};
use troupe_kernel::event::{SayCategory, StepEventKind, WorkProduct};
use troupe_kernel::plan::PlanDescription;
use troupe_kernel::services::{CapabilityCall, ReasonRequest, UploadRequest, UserQuestion};
use troupe_kernel::step::{
    OutputRecord, ResultType, Step, StepRef, StepStatus, verb,
};

use crate::agent::Agent;
use crate::control_flow::{self, VerbOutcome};
use crate::reflection::{self, ReflectionVerdict};
use crate::resolver::{self, ResolutionSources};

/// What executing one step produced. Side effects on the step list are
/// applied at the batch-join boundary, never from inside execution.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    Completed(Vec<OutputRecord>),
    /// A control-flow expansion: children plus completion records.
    Expand {
        plan: PlanDescription,
        records: Vec<OutputRecord>,
        scope: Option<Uuid>,
    },
    /// A `FOREACH` batch; the step stays pending for the next sweep.
    ForEachBatch {
        plan: PlanDescription,
        next_index: usize,
    },
    /// Not actionable yet (`REGROUP` members still running).
    Defer,
    /// Parked pending a user answer keyed by the request id.
    AwaitingUser { request_id: Uuid },
    Failed(ErrorSignal),
    /// Execution was cancelled by pause/abort.
    Interrupted,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Agent {
    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Drive the agent until it reaches a terminal state.
    pub async fn run(&self) -> KernelResult<()> {
        self.start().await?;
        let idle = Duration::from_millis(self.inner.config.idle_sweep_ms);

        loop {
            let state = *self.inner.state.read().await;
            match state {
                AgentState::Running => {}
                AgentState::Paused => {
                    sleep(idle).await;
                    continue;
                }
                _ => break,
            }

            self.stuck_state_sweep().await;

            let ready = self.ready_steps().await;
            if ready.is_empty() {
                // A role agent provisioned with no steps yet idles until a
                // delegation arrives.
                if self.inner.steps.read().await.is_empty() {
                    sleep(idle).await;
                    continue;
                }
                if self.has_active_work().await {
                    sleep(idle).await;
                    continue;
                }
                if self.begin_mission_reflection().await {
                    continue;
                }
                self.complete_mission().await;
                break;
            }

            // Partition into delegable and local work. Delegation failures
            // fall back to local execution.
            let mut local = Vec::new();
            for step in ready {
                let delegable = self.inner.role != COORDINATOR_ROLE
                    && step
                        .recommended_role
                        .as_deref()
                        .is_some_and(|role| role != self.inner.role);
                if delegable {
                    let role = step.recommended_role.clone().unwrap_or_default();
                    if let Err(e) = self.delegate_step(step.id, &role).await {
                        warn!(agent = %self.inner.id, step = %step.id, error = %e,
                            "delegation failed; executing locally");
                        local.push(step);
                    }
                } else {
                    local.push(step);
                }
            }
            if local.is_empty() {
                continue;
            }

            // Mark long-running dispatches. Control-flow expansion is
            // instantaneous: those steps complete (or re-enqueue, for a
            // batching FOREACH or deferred REGROUP) straight from `Pending`.
            for step in &local {
                if !verb::is_control_flow(&step.verb) {
                    self.mark_running(step.id).await;
                }
            }

            let snapshot: Arc<Vec<Step>> = Arc::new(self.inner.steps.read().await.clone());
            let executions = local.into_iter().map(|step| {
                let snapshot = Arc::clone(&snapshot);
                async move {
                    let step_id = step.id;
                    let from = if verb::is_control_flow(&step.verb) {
                        StepStatus::Pending
                    } else {
                        StepStatus::Running
                    };
                    let (inputs, outcome) = self.execute_step(step, &snapshot).await;
                    (step_id, from, inputs, outcome)
                }
            });
            let outcomes = futures::future::join_all(executions).await;

            let mut progressed = false;
            for (step_id, from, inputs, outcome) in outcomes {
                if !matches!(outcome, StepOutcome::Defer) {
                    progressed = true;
                }
                self.apply_outcome(step_id, from, inputs, outcome).await;
            }

            self.deadlock_sweep().await;

            if !progressed {
                sleep(idle).await;
            }
        }
        Ok(())
    }

    async fn start(&self) -> KernelResult<()> {
        {
            let mut state = self.inner.state.write().await;
            // A resume() may already have moved the agent to Running.
            if *state != AgentState::Running {
                *state = state.transition_to(AgentState::Running, self.inner.id)?;
            }
        }
        self.register().await?;
        self.start_checkpoint_timer().await;
        self.inner
            .publisher
            .agent_state(AgentState::Running, self.statistics().await)
            .await;
        info!(agent = %self.inner.id, mission = %self.inner.mission_id, role = %self.inner.role,
            "agent running");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Steps in `Pending` whose backoff has elapsed and whose dependencies
    /// are satisfied.
    pub(crate) async fn ready_steps(&self) -> Vec<Step> {
        let steps = self.inner.steps.read().await.clone();
        let now = now_ms();
        let mut ready = Vec::new();
        for step in &steps {
            if step.status != StepStatus::Pending {
                continue;
            }
            if step.backoff_until_ms.is_some_and(|until| until > now) {
                continue;
            }
            if self.dependencies_satisfied(step, &steps).await {
                ready.push(step.clone());
            }
        }
        ready
    }

    /// Every non-signal dependency's source is completed with a non-null
    /// named output; every signal dependency's source is completed; a
    /// parent-scope dependency requires the parent itself to be ready.
    async fn dependencies_satisfied(&self, step: &Step, steps: &[Step]) -> bool {
        for dep in &step.dependencies {
            match dep.source_step {
                StepRef::Parent => {
                    let Some(parent) = step
                        .parent_id
                        .and_then(|pid| steps.iter().find(|s| s.id == pid))
                    else {
                        return false;
                    };
                    let parent_ready = parent.status == StepStatus::Completed
                        || parent.input_values.contains_key(&dep.output_name);
                    if !parent_ready {
                        return false;
                    }
                }
                StepRef::Step(source_id) => {
                    if let Some(source) = steps.iter().find(|s| s.id == source_id) {
                        if source.status != StepStatus::Completed {
                            return false;
                        }
                        if !dep.is_signal() {
                            let has_output = source
                                .output(&dep.output_name)
                                .is_some_and(|r| !r.result.is_null());
                            // A pruned output resolves through persistence.
                            let pruned = source.output(&dep.output_name).is_some();
                            if !has_output && !pruned {
                                return false;
                            }
                        }
                    } else {
                        // Possibly owned by another agent: consult the
                        // registry for a completed remote view.
                        match self.inner.cross_agent.resolve(source_id).await {
                            Ok(Some(view)) if view.status == StepStatus::Completed => {
                                if !dep.is_signal()
                                    && !view
                                        .result
                                        .iter()
                                        .any(|r| r.name == dep.output_name && !r.result.is_null())
                                {
                                    return false;
                                }
                            }
                            _ => return false,
                        }
                    }
                }
            }
        }
        true
    }

    /// Whether any step still represents outstanding work, including steps
    /// delegated out and not yet resolved.
    pub(crate) async fn has_active_work(&self) -> bool {
        if !self.inner.pending_delegations.lock().await.is_empty() {
            return true;
        }
        self.inner.steps.read().await.iter().any(|s| {
            matches!(
                s.status,
                StepStatus::Pending
                    | StepStatus::Running
                    | StepStatus::Waiting
                    | StepStatus::SubPlanRunning
            )
        })
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute_step(
        &self,
        step: Step,
        snapshot: &[Step],
    ) -> (HashMap<String, Value>, StepOutcome) {
        let sources = ResolutionSources {
            steps: snapshot,
            cross_agent: Some(&self.inner.cross_agent),
            persistence: Some(&self.inner.services.persistence),
        };
        let inputs =
            resolver::resolve_inputs(&step, self.inner.mission_id, &sources).await;

        let failed = resolver::failed_inputs(&inputs);
        if !failed.is_empty() {
            let signal = ErrorSignal::message(format!(
                "unresolved inputs: {}",
                failed.join(", ")
            ))
            .with_code(code::RECOVERABLE);
            return (inputs, StepOutcome::Failed(signal));
        }

        let outcome = if verb::is_control_flow(&step.verb) {
            match control_flow::execute(&step, &inputs, snapshot, &self.inner.config) {
                VerbOutcome::Expand {
                    plan,
                    records,
                    scope,
                } => StepOutcome::Expand {
                    plan,
                    records,
                    scope,
                },
                VerbOutcome::InProgress { plan, next_index } => {
                    StepOutcome::ForEachBatch { plan, next_index }
                }
                VerbOutcome::Defer => StepOutcome::Defer,
                VerbOutcome::Fail(signal) => StepOutcome::Failed(signal),
            }
        } else {
            match step.verb.as_str() {
                verb::RETURN => return_outputs(&inputs),
                verb::ASK_USER => self.ask_user(&step, &inputs).await,
                v if verb::is_reasoning(v) => self.dispatch_reasoning(&step, &inputs).await,
                _ => self.dispatch_capability(&step, &inputs).await,
            }
        };
        (inputs, outcome)
    }

    async fn dispatch_capability(
        &self,
        step: &Step,
        inputs: &HashMap<String, Value>,
    ) -> StepOutcome {
        let timeout_ms = step
            .timeout_ms
            .unwrap_or_else(|| self.inner.config.default_timeout_ms(&step.verb));
        let call = CapabilityCall {
            mission_id: self.inner.mission_id,
            agent_id: self.inner.id,
            step_id: step.id,
            verb: step.verb.clone(),
            inputs: inputs.clone(),
            timeout_ms,
        };
        let cancel = self.inner.cancel.lock().await.clone();
        let execution = self.inner.services.capability.execute(call, cancel.clone());

        tokio::select! {
            _ = cancel.cancelled() => StepOutcome::Interrupted,
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), execution) => {
                match result {
                    Err(_) => StepOutcome::Failed(
                        ErrorSignal::message(format!("execution timed out after {timeout_ms}ms"))
                            .with_code(code::TRANSIENT),
                    ),
                    Ok(Err(e)) => StepOutcome::Failed(ErrorSignal::message(e.to_string())),
                    Ok(Ok(records)) => interpret_records(records),
                }
            }
        }
    }

    async fn dispatch_reasoning(
        &self,
        step: &Step,
        inputs: &HashMap<String, Value>,
    ) -> StepOutcome {
        let timeout_ms = step
            .timeout_ms
            .unwrap_or_else(|| self.inner.config.default_timeout_ms(&step.verb));
        let request = ReasonRequest {
            mission_id: self.inner.mission_id,
            agent_id: self.inner.id,
            step_id: step.id,
            verb: step.verb.clone(),
            inputs: inputs.clone(),
            conversation: self.inner.conversation.read().await.clone(),
        };
        let cancel = self.inner.cancel.lock().await.clone();
        let reasoning = self.inner.services.reasoning.reason(request, cancel.clone());

        tokio::select! {
            _ = cancel.cancelled() => StepOutcome::Interrupted,
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), reasoning) => {
                match result {
                    Err(_) => StepOutcome::Failed(
                        ErrorSignal::message(format!("reasoning timed out after {timeout_ms}ms"))
                            .with_code(code::TRANSIENT),
                    ),
                    Ok(Err(e)) => StepOutcome::Failed(ErrorSignal::message(e.to_string())),
                    Ok(Ok(records)) => interpret_records(records),
                }
            }
        }
    }

    async fn ask_user(&self, step: &Step, inputs: &HashMap<String, Value>) -> StepOutcome {
        let question = inputs
            .get("question")
            .map(|q| match q {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| step.description.clone());

        let request_id = Uuid::new_v4();
        let ask = self
            .inner
            .services
            .gateway
            .ask(UserQuestion {
                mission_id: self.inner.mission_id,
                agent_id: self.inner.id,
                step_id: step.id,
                request_id,
                question,
            })
            .await;
        match ask {
            Ok(()) => StepOutcome::AwaitingUser { request_id },
            Err(e) => StepOutcome::Failed(ErrorSignal::message(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Outcome application
    // -----------------------------------------------------------------------

    async fn apply_outcome(
        &self,
        step_id: Uuid,
        from: StepStatus,
        inputs: HashMap<String, Value>,
        outcome: StepOutcome,
    ) {
        // Record the resolved inputs first: expansions copy parent values
        // from here, and checkpoints carry them.
        {
            let mut steps = self.inner.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                step.input_values = inputs;
            }
        }

        match outcome {
            StepOutcome::Completed(records) => {
                self.apply_completed(step_id, from, records).await;
            }
            StepOutcome::Expand {
                plan,
                records,
                scope,
            } => {
                let Some(parent) = self.step(step_id).await else {
                    return;
                };
                let assembled = {
                    let steps = self.inner.steps.read().await;
                    crate::assembler::assemble(
                        &plan,
                        &crate::assembler::AssemblyContext::expansion(&parent, scope, &steps),
                    )
                };
                match assembled {
                    Ok(children) => {
                        if let Err(e) = self.finish_step(step_id, records.clone()).await {
                            self.route_failure(
                                step_id,
                                ErrorSignal::message(e.to_string()).with_code(code::VALIDATION),
                                &parent.verb,
                            )
                            .await;
                            return;
                        }
                        self.push_steps(children).await;
                        self.after_step_completed(step_id, from, &records).await;
                    }
                    Err(e) => {
                        self.route_failure(
                            step_id,
                            ErrorSignal::message(e.to_string()).with_code(code::VALIDATION),
                            &parent.verb,
                        )
                        .await;
                    }
                }
            }
            StepOutcome::ForEachBatch { plan, next_index } => {
                let Some(parent) = self.step(step_id).await else {
                    return;
                };
                let assembled = {
                    let steps = self.inner.steps.read().await;
                    crate::assembler::assemble(
                        &plan,
                        &crate::assembler::AssemblyContext::expansion(
                            &parent,
                            Some(parent.id),
                            &steps,
                        ),
                    )
                };
                match assembled {
                    Ok(children) => {
                        {
                            let mut steps = self.inner.steps.write().await;
                            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                                step.current_index = next_index;
                                step.updated_at = chrono::Utc::now();
                            }
                        }
                        debug!(step = %step_id, next_index, "foreach batch applied");
                        self.push_steps(children).await;
                    }
                    Err(e) => {
                        self.route_failure(
                            step_id,
                            ErrorSignal::message(e.to_string()).with_code(code::VALIDATION),
                            &parent.verb,
                        )
                        .await;
                    }
                }
            }
            StepOutcome::Defer => {}
            StepOutcome::AwaitingUser { request_id } => {
                {
                    let mut steps = self.inner.steps.write().await;
                    if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                        step.awaits_signal = Some(request_id);
                        if let Err(e) = step.transition(StepStatus::Waiting) {
                            warn!(step = %step_id, error = %e, "could not park step");
                        }
                    }
                }
                self.inner
                    .pending_questions
                    .lock()
                    .await
                    .insert(request_id, step_id);
                self.inner
                    .publisher
                    .step_event(
                        step_id,
                        StepEventKind::StatusChanged {
                            from,
                            to: StepStatus::Waiting,
                        },
                    )
                    .await;
            }
            StepOutcome::Failed(signal) => {
                let verb = self
                    .step(step_id)
                    .await
                    .map(|s| s.verb)
                    .unwrap_or_default();
                self.route_failure(step_id, signal, &verb).await;
            }
            StepOutcome::Interrupted => {
                // Park without a request id; resume() returns these to
                // Pending.
                let mut steps = self.inner.steps.write().await;
                if let Some(step) = steps.iter_mut().find(|s| s.id == step_id)
                    && step.status == StepStatus::Running
                {
                    let _ = step.transition(StepStatus::Waiting);
                }
            }
        }
    }

    async fn apply_completed(&self, step_id: Uuid, from: StepStatus, records: Vec<OutputRecord>) {
        let Some(step) = self.step(step_id).await else {
            return;
        };

        if step.verb == verb::REFLECT {
            self.apply_reflect_completion(step, from, records).await;
            return;
        }

        // Plan-typed records become new steps (plan-producing step).
        let mut batches = Vec::new();
        for record in records
            .iter()
            .filter(|r| r.result_type == ResultType::Plan && r.result.is_array())
        {
            let plan = match PlanDescription::from_value(&record.result) {
                Ok(plan) => plan,
                Err(e) => {
                    self.route_failure(
                        step_id,
                        ErrorSignal::message(format!("unusable plan output: {e}"))
                            .with_code(code::VALIDATION),
                        &step.verb,
                    )
                    .await;
                    return;
                }
            };
            let assembled = {
                let steps = self.inner.steps.read().await;
                crate::assembler::assemble(
                    &plan,
                    &crate::assembler::AssemblyContext::expansion(&step, None, &steps),
                )
            };
            match assembled {
                Ok(children) => batches.push(children),
                Err(e) => {
                    self.route_failure(
                        step_id,
                        ErrorSignal::message(format!("unusable plan output: {e}"))
                            .with_code(code::VALIDATION),
                        &step.verb,
                    )
                    .await;
                    return;
                }
            }
        }

        if let Err(e) = self.finish_step(step_id, records.clone()).await {
            self.route_failure(
                step_id,
                ErrorSignal::message(e.to_string()).with_code(code::VALIDATION),
                &step.verb,
            )
            .await;
            return;
        }
        for batch in batches {
            self.push_steps(batch).await;
        }
        self.after_step_completed(step_id, from, &records).await;
    }

    /// Complete the step record in the list, enforcing the completion
    /// invariant.
    async fn finish_step(&self, step_id: Uuid, records: Vec<OutputRecord>) -> KernelResult<()> {
        let mut steps = self.inner.steps.write().await;
        let step = steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| troupe_kernel::error::KernelError::Persistence(format!(
                "step {step_id} vanished"
            )))?;
        step.backoff_until_ms = None;
        step.complete(records)
    }

    // -----------------------------------------------------------------------
    // Reflection plumbing
    // -----------------------------------------------------------------------

    /// Fire end-of-mission reflection once. Returns `true` if a reflect step
    /// was appended.
    async fn begin_mission_reflection(&self) -> bool {
        {
            let mut reflection = self.inner.reflection.lock().await;
            if reflection.reflection_done {
                return false;
            }
            reflection.reflection_done = true;
        }
        let reflect = reflection::mission_reflect_step(
            self.inner.mission_id,
            self.inner.id,
            self.plan_history().await,
            self.work_summary().await,
        );
        info!(agent = %self.inner.id, step = %reflect.id, "end-of-mission reflection");
        self.push_steps(vec![reflect]).await;
        true
    }

    async fn apply_reflect_completion(
        &self,
        step: Step,
        from: StepStatus,
        mut records: Vec<OutputRecord>,
    ) {
        if records.is_empty() {
            records.push(OutputRecord::new("answer", Value::String(String::new())));
        }
        let phase = reflection::reflect_phase(&step);
        let verdict = reflection::interpret(&records);

        if let Err(e) = self.finish_step(step.id, records.clone()).await {
            warn!(step = %step.id, error = %e, "reflect completion failed");
            return;
        }

        match verdict {
            ReflectionVerdict::NewPlan(plan) => {
                if phase == reflection::PHASE_FAILURE {
                    let signature = reflection::plan_signature(&plan);
                    let looped = self
                        .inner
                        .reflection
                        .lock()
                        .await
                        .note_signature(signature, &self.inner.config);
                    if looped {
                        self.inner
                            .publisher
                            .say(
                                SayCategory::Unrecoverable,
                                "infinite reflection loop: the same recovery plan keeps coming back",
                            )
                            .await;
                        self.fail_agent("infinite reflection loop").await;
                        return;
                    }
                } else {
                    // A mission reflection that produced new work re-arms
                    // itself for the next quiescence.
                    self.inner.reflection.lock().await.reflection_done = false;
                }

                match self.expand_plan(&plan, &step, None).await {
                    Ok(count) => {
                        info!(agent = %self.inner.id, steps = count, "reflection appended a recovery plan");
                    }
                    Err(e) => {
                        error!(agent = %self.inner.id, error = %e, "reflection plan failed to assemble");
                        self.fail_agent("reflection produced an unusable plan").await;
                        return;
                    }
                }
            }
            ReflectionVerdict::MissionAccomplished => {
                debug!(agent = %self.inner.id, "reflection: mission accomplished");
            }
            ReflectionVerdict::DirectAnswer(goal) => {
                self.cancel_dependents(step.id).await;
                let accomplish = self.accomplish_step(&goal);
                self.push_steps(vec![accomplish]).await;
                self.inner.reflection.lock().await.reflection_done = false;
            }
            ReflectionVerdict::Continue => {}
        }

        self.after_step_completed(step.id, from, &records).await;
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    /// Route a step failure per its classification: retry, park for user
    /// input, or surface and replan.
    pub(crate) async fn route_failure(&self, step_id: Uuid, signal: ErrorSignal, verb: &str) {
        let class = signal.classify();
        {
            let mut steps = self.inner.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                step.last_error = Some(signal.message.clone());
                step.error_context = Some(format!(
                    "class={class} code={} status={}",
                    signal.code.as_deref().unwrap_or("-"),
                    signal
                        .http_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".into()),
                ));
            }
        }
        self.inner
            .publisher
            .step_event(
                step_id,
                StepEventKind::Failed {
                    class,
                    message: signal.message.clone(),
                },
            )
            .await;

        match class {
            ErrorClass::Transient => {
                if self.retry(step_id, false).await {
                    return;
                }
                self.surface_failure(step_id, &signal, verb).await;
            }
            ErrorClass::Recoverable => {
                if self.retry(step_id, true).await {
                    return;
                }
                self.surface_failure(step_id, &signal, verb).await;
            }
            ErrorClass::Validation => {
                self.mark_error(step_id).await;
                self.replan_from_failure(step_id, &signal, verb).await;
            }
            ErrorClass::UserInputNeeded => {
                self.park_for_user_input(step_id, &signal).await;
            }
            ErrorClass::Permanent => {
                self.surface_failure(step_id, &signal, verb).await;
            }
            _ => unreachable!("ErrorClass is non_exhaustive but all variants are handled"),
        }
    }

    /// Reset a step for retry. Returns `false` when the budget is exhausted.
    async fn retry(&self, step_id: Uuid, recoverable: bool) -> bool {
        let (retried, attempt, backoff_ms) = {
            let mut steps = self.inner.steps.write().await;
            let Some(step) = steps.iter_mut().find(|s| s.id == step_id) else {
                return false;
            };
            if recoverable {
                if !step.can_retry_recoverable() {
                    return false;
                }
                step.recoverable_retry_count += 1;
                // Data-shape failures wait a short fixed delay for partial
                // work to land.
                let backoff = self.inner.config.default_backoff_ms;
                step.backoff_until_ms = Some(now_ms() + backoff);
                step.status = StepStatus::Pending;
                step.updated_at = chrono::Utc::now();
                (true, step.recoverable_retry_count, backoff)
            } else {
                if !step.can_retry_transient() {
                    return false;
                }
                let backoff = self.inner.config.backoff_ms(step.retry_count);
                step.retry_count += 1;
                step.backoff_until_ms = Some(now_ms() + backoff);
                step.status = StepStatus::Pending;
                step.updated_at = chrono::Utc::now();
                (true, step.retry_count, backoff)
            }
        };
        if retried {
            self.inner
                .publisher
                .step_event(
                    step_id,
                    StepEventKind::Retried {
                        attempt,
                        backoff_ms,
                    },
                )
                .await;
            self.inner
                .publisher
                .say(
                    SayCategory::Retrying,
                    format!("retrying a step (attempt {attempt})"),
                )
                .await;
        }
        retried
    }

    /// Park a step awaiting a user answer, unless its inputs have become
    /// resolvable in the meantime (stuck-state pre-check).
    async fn park_for_user_input(&self, step_id: Uuid, signal: &ErrorSignal) {
        if self.reset_if_resolvable(step_id).await {
            return;
        }

        let request_id = Uuid::new_v4();
        let question = signal.message.clone();
        {
            let mut steps = self.inner.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                step.awaits_signal = Some(request_id);
                let _ = step.transition(StepStatus::Waiting);
            }
        }
        self.inner
            .pending_questions
            .lock()
            .await
            .insert(request_id, step_id);
        let _ = self
            .inner
            .services
            .gateway
            .ask(UserQuestion {
                mission_id: self.inner.mission_id,
                agent_id: self.inner.id,
                step_id,
                request_id,
                question,
            })
            .await;
    }

    /// Mark a step failed, cancel its dependents, and attempt a reflective
    /// replan; give up on the mission when replanning is not admissible.
    async fn surface_failure(&self, step_id: Uuid, signal: &ErrorSignal, verb: &str) {
        self.mark_error(step_id).await;
        self.inner
            .publisher
            .say(
                SayCategory::AbortingBranch,
                format!("abandoning a failed branch: {}", signal.message),
            )
            .await;
        self.cancel_dependents(step_id).await;
        self.replan_from_failure(step_id, signal, verb).await;
    }

    async fn replan_from_failure(&self, step_id: Uuid, signal: &ErrorSignal, verb: &str) {
        let Some(step) = self.step(step_id).await else {
            return;
        };

        let decision = {
            let mut reflection = self.inner.reflection.lock().await;
            let decision = reflection.may_replan(&step, &self.inner.config);
            if decision == crate::reflection::ReplanDecision::Allowed {
                reflection.replan_depth += 1;
                reflection.total_replans += 1;
                reflection.replanned_steps.insert(step_id);
            }
            reflection.note_verb_failure(verb);
            decision
        };

        if decision != crate::reflection::ReplanDecision::Allowed {
            warn!(agent = %self.inner.id, step = %step_id, reason = decision.reason(),
                "replanning denied");
            self.inner
                .publisher
                .say(
                    SayCategory::Unrecoverable,
                    format!("cannot recover: {}", decision.reason()),
                )
                .await;
            self.inner
                .publisher
                .step_failure(step_id, verb, &signal.message)
                .await;
            self.fail_agent(decision.reason()).await;
            return;
        }

        self.inner
            .publisher
            .say(
                SayCategory::Replanning,
                format!("replanning after failure of {verb}"),
            )
            .await;
        let reflect =
            reflection::failure_reflect_step(&step, &signal.message, self.work_summary().await);
        self.push_steps(vec![reflect]).await;
    }

    async fn mark_error(&self, step_id: Uuid) {
        let from = {
            let mut steps = self.inner.steps.write().await;
            let Some(step) = steps.iter_mut().find(|s| s.id == step_id) else {
                return;
            };
            if step.status == StepStatus::Error {
                return;
            }
            let from = step.status;
            if step.transition(StepStatus::Error).is_err() {
                return;
            }
            from
        };
        self.inner
            .publisher
            .step_event(
                step_id,
                StepEventKind::StatusChanged {
                    from,
                    to: StepStatus::Error,
                },
            )
            .await;
    }

    /// Fail the whole agent.
    pub(crate) async fn fail_agent(&self, reason: &str) {
        error!(agent = %self.inner.id, reason, "agent failed");
        {
            let mut state = self.inner.state.write().await;
            if let Ok(next) = state.transition_to(AgentState::Error, self.inner.id) {
                *state = next;
            }
        }
        self.stop_checkpoint_timer().await;
        self.inner.cancel.lock().await.cancel();
        self.inner
            .publisher
            .say(SayCategory::MissionFailed, format!("mission failed: {reason}"))
            .await;
        self.inner
            .publisher
            .agent_state(AgentState::Error, self.statistics().await)
            .await;
    }

    // -----------------------------------------------------------------------
    // Deadlock and cancellation sweeps
    // -----------------------------------------------------------------------

    /// Cancel `Pending` steps whose dependencies can never be satisfied, and
    /// their transitive dependents.
    pub(crate) async fn deadlock_sweep(&self) {
        let mut cancelled = Vec::new();
        {
            let mut steps = self.inner.steps.write().await;
            loop {
                let snapshot = steps.clone();
                let mut progress = false;
                for step in steps.iter_mut() {
                    if step.status != StepStatus::Pending {
                        continue;
                    }
                    if permanently_unsatisfied(step, &snapshot) {
                        if step.transition(StepStatus::Cancelled).is_ok() {
                            cancelled.push(step.id);
                            progress = true;
                        }
                    }
                }
                if !progress {
                    break;
                }
            }
        }
        for step_id in cancelled {
            warn!(agent = %self.inner.id, step = %step_id, "cancelled: dependencies permanently unsatisfied");
            self.inner
                .publisher
                .step_event(
                    step_id,
                    StepEventKind::StatusChanged {
                        from: StepStatus::Pending,
                        to: StepStatus::Cancelled,
                    },
                )
                .await;
        }
    }

    /// Cancel all pending transitive dependents of a step.
    pub(crate) async fn cancel_dependents(&self, root: Uuid) {
        let mut cancelled = Vec::new();
        {
            let mut steps = self.inner.steps.write().await;
            let mut doomed: HashSet<Uuid> = HashSet::from([root]);
            loop {
                let mut progress = false;
                let snapshot: Vec<(Uuid, Vec<Uuid>, StepStatus)> = steps
                    .iter()
                    .map(|s| {
                        (
                            s.id,
                            s.dependencies
                                .iter()
                                .filter_map(|d| d.source_step.step_id())
                                .collect(),
                            s.status,
                        )
                    })
                    .collect();
                for (id, dep_sources, status) in snapshot {
                    if status == StepStatus::Pending
                        && !doomed.contains(&id)
                        && dep_sources.iter().any(|src| doomed.contains(src))
                    {
                        doomed.insert(id);
                        progress = true;
                    }
                }
                if !progress {
                    break;
                }
            }
            doomed.remove(&root);
            for step in steps.iter_mut() {
                if doomed.contains(&step.id) && step.transition(StepStatus::Cancelled).is_ok() {
                    cancelled.push(step.id);
                }
            }
        }
        for step_id in cancelled {
            self.inner
                .publisher
                .step_event(
                    step_id,
                    StepEventKind::StatusChanged {
                        from: StepStatus::Pending,
                        to: StepStatus::Cancelled,
                    },
                )
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Stuck-state recovery
    // -----------------------------------------------------------------------

    /// Periodic sweep: waiting steps whose requests are still outstanding
    /// are reset to `Pending` once their inputs have become resolvable.
    pub(crate) async fn stuck_state_sweep(&self) {
        let waiting: Vec<Uuid> = {
            let questions = self.inner.pending_questions.lock().await;
            questions.values().copied().collect()
        };
        for step_id in waiting {
            self.reset_if_resolvable(step_id).await;
        }
    }

    /// Re-run the resolver for a parked step: if placeholders from its input
    /// template have become resolvable (the data arrived since the step was
    /// parked), discard its user-input request and reset it to `Pending`.
    async fn reset_if_resolvable(&self, step_id: Uuid) -> bool {
        let Some(step) = self.step(step_id).await else {
            return false;
        };
        if !matches!(step.status, StepStatus::Waiting | StepStatus::Running) {
            return false;
        }

        // Only steps that were blocked on `{…}` placeholders can recover
        // this way; a clean-input step genuinely needs its user answer.
        let template = resolver::template_placeholders(&step);
        if template.is_empty() {
            return false;
        }

        let snapshot = self.inner.steps.read().await.clone();
        let sources = ResolutionSources {
            steps: &snapshot,
            cross_agent: Some(&self.inner.cross_agent),
            persistence: Some(&self.inner.services.persistence),
        };
        let values = resolver::resolve_inputs(&step, self.inner.mission_id, &sources).await;
        if !resolver::failed_inputs(&values).is_empty()
            || resolver::unresolved_placeholders(&values).len() >= template.len()
        {
            return false;
        }

        {
            let mut questions = self.inner.pending_questions.lock().await;
            questions.retain(|_, waiting_step| *waiting_step != step_id);
        }
        {
            let mut steps = self.inner.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                step.awaits_signal = None;
                // Re-queue reset, same as the retry path.
                step.status = StepStatus::Pending;
                step.updated_at = chrono::Utc::now();
            }
        }
        info!(agent = %self.inner.id, step = %step_id,
            "stuck step recovered: inputs resolved while waiting");
        true
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    async fn mark_running(&self, step_id: Uuid) {
        let changed = {
            let mut steps = self.inner.steps.write().await;
            steps
                .iter_mut()
                .find(|s| s.id == step_id)
                .is_some_and(|step| step.transition(StepStatus::Running).is_ok())
        };
        if changed {
            self.inner
                .publisher
                .step_event(
                    step_id,
                    StepEventKind::StatusChanged {
                        from: StepStatus::Pending,
                        to: StepStatus::Running,
                    },
                )
                .await;
        }
    }

    /// Transition to `Completed`, loading the final step's work-product as
    /// the agent output and attaching deliverables.
    async fn complete_mission(&self) {
        let final_step = {
            let steps = self.inner.steps.read().await;
            steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed && !s.result.is_empty())
                .max_by_key(|s| {
                    // Prefer explicitly marked deliverables, then recency.
                    let deliverable = s.result.iter().any(|r| r.is_deliverable);
                    (deliverable, s.updated_at)
                })
                .cloned()
        };

        if let Some(step) = final_step {
            let mut work_product = match self
                .inner
                .services
                .persistence
                .load_work_product(step.id)
                .await
            {
                Ok(Some(wp)) => wp,
                _ => WorkProduct::new(
                    self.inner.mission_id,
                    self.inner.id,
                    step.id,
                    step.verb.clone(),
                    step.result.clone(),
                ),
            };
            self.attach_deliverables(&step, &mut work_product).await;
            self.inner.publisher.work_product(&work_product).await;
            *self.inner.output.write().await = Some(work_product);
        }

        {
            let mut state = self.inner.state.write().await;
            if let Ok(next) = state.transition_to(AgentState::Completed, self.inner.id) {
                *state = next;
            }
        }
        self.stop_checkpoint_timer().await;
        self.inner
            .publisher
            .say(SayCategory::MissionAccomplished, "mission accomplished")
            .await;
        self.inner
            .publisher
            .agent_state(AgentState::Completed, self.statistics().await)
            .await;
        info!(agent = %self.inner.id, mission = %self.inner.mission_id, "mission completed");
    }

    /// Upload deliverable payloads (explicitly marked records, or the final
    /// endpoint's outputs) and attach the file metadata.
    async fn attach_deliverables(&self, step: &Step, work_product: &mut WorkProduct) {
        let marked: Vec<&OutputRecord> = step.result.iter().filter(|r| r.is_deliverable).collect();
        let records: Vec<&OutputRecord> = if marked.is_empty() {
            // The final endpoint's non-empty output counts as a deliverable.
            step.result.iter().take(1).collect()
        } else {
            marked
        };

        for record in records {
            if record.result.is_null() {
                continue;
            }
            let request = UploadRequest {
                original_name: format!("{}.json", record.name),
                mime_type: record
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/json".to_string()),
                payload: record.result.clone(),
                uploaded_by: self.inner.id,
                step_id: step.id,
                is_deliverable: true,
            };
            match self.inner.services.files.upload(request).await {
                Ok(attachment) => work_product.attachments.push(attachment),
                Err(e) => {
                    warn!(agent = %self.inner.id, step = %step.id, error = %e,
                        "deliverable upload failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Record interpretation
// ---------------------------------------------------------------------------

/// Map service output records to an outcome: error records route through the
/// classifier, a pending-user-input record parks the step, anything else
/// completes it.
fn interpret_records(records: Vec<OutputRecord>) -> StepOutcome {
    if let Some(error) = records.iter().find(|r| r.result_type == ResultType::Error) {
        let mut signal = ErrorSignal::from_value(&error.result);
        if signal.message.is_empty() {
            signal.message = "step returned an error result".into();
        }
        return StepOutcome::Failed(signal);
    }
    if let Some(pending) = records
        .iter()
        .find(|r| r.result_type == ResultType::PendingUserInput)
    {
        if let Some(request_id) = pending.result.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
            return StepOutcome::AwaitingUser { request_id };
        }
        return StepOutcome::Failed(ErrorSignal::message(
            "pending-user-input record without a request id",
        ));
    }
    if records.is_empty() {
        return StepOutcome::Failed(
            ErrorSignal::message("execution returned no output records")
                .with_code(code::RECOVERABLE),
        );
    }
    StepOutcome::Completed(records)
}

/// `RETURN` echoes its resolved inputs back as deliverable outputs.
fn return_outputs(inputs: &HashMap<String, Value>) -> StepOutcome {
    let mut records: Vec<OutputRecord> = inputs
        .iter()
        .filter(|(name, _)| *name != "missionId" && !name.starts_with("__"))
        .map(|(name, value)| OutputRecord::new(name.clone(), value.clone()).deliverable())
        .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    if records.is_empty() {
        records.push(OutputRecord::new("answer", Value::Null).deliverable());
    }
    StepOutcome::Completed(records)
}

/// A pending step is permanently blocked when a local dependency source has
/// failed, was cancelled or replaced, or completed without the named output.
fn permanently_unsatisfied(step: &Step, steps: &[Step]) -> bool {
    for dep in &step.dependencies {
        let StepRef::Step(source_id) = dep.source_step else {
            continue;
        };
        let Some(source) = steps.iter().find(|s| s.id == source_id) else {
            // Unknown locally: possibly remote, not provably dead.
            continue;
        };
        match source.status {
            StepStatus::Error | StepStatus::Cancelled | StepStatus::Replaced => return true,
            StepStatus::Completed if !dep.is_signal() => {
                if source.output(&dep.output_name).is_none() {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}
