//! Role-based delegation.
//!
//! A ready step carrying a recommended role that differs from the agent's own
//! role is handed to a role-specialised sibling: the registry is queried (and
//! asked to provision an agent when none exists), ownership transfers
//! atomically from the scheduler's perspective, and the delegator waits for a
//! task-result message keyed by a generated task id.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use troupe_kernel::agent::AgentState;
use troupe_kernel::error::{ErrorSignal, KernelError, KernelResult, code};
use troupe_kernel::event::StepEventKind;
use troupe_kernel::message::InboundMessage;
use troupe_kernel::services::{AgentInfo, StepLocation};
use troupe_kernel::step::{DelegationRecord, OutputRecord, Step, StepStatus};

use crate::agent::Agent;

/// How often the provisioning poll re-checks a requested agent.
const PROVISION_POLL_INTERVAL_MS: u64 = 500;

impl Agent {
    /// Hand a ready step to an agent of its recommended role.
    ///
    /// On success the step has left this agent's list and a `SubPlanRunning`
    /// mirror tracks the outstanding task. Errors leave the step untouched in
    /// the list so the caller can fall back to local execution.
    pub(crate) async fn delegate_step(&self, step_id: Uuid, role: &str) -> KernelResult<()> {
        let target = self.find_or_provision(role).await?;

        let task_id = Uuid::new_v4();
        // Take the step out of the local list and stamp the transfer. Both
        // mutations happen under the step-list lock, so the scheduler never
        // observes a half-transferred step.
        let mut step = {
            let mut steps = self.inner.steps.write().await;
            let position = steps
                .iter()
                .position(|s| s.id == step_id)
                .ok_or_else(|| KernelError::Delegation(format!("step {step_id} not found")))?;
            let mut step = steps.remove(position);
            step.delegation_history.push(DelegationRecord::new(
                self.inner.id,
                target.agent_id,
                format!("recommended role '{role}'"),
            ));
            step.current_owner = target.agent_id;
            step
        };

        self.inner
            .services
            .directory
            .update_step_location(
                step.id,
                StepLocation {
                    owner_agent_id: target.agent_id,
                    agent_host: target.host.clone(),
                },
            )
            .await?;

        let transfer_id = step
            .delegation_history
            .last()
            .map(|r| r.transfer_id)
            .unwrap_or_default();
        self.inner
            .publisher
            .step_event(
                step.id,
                StepEventKind::Delegated {
                    to_agent: target.agent_id,
                    transfer_id,
                },
            )
            .await;

        let sent = self
            .inner
            .services
            .bus
            .send(
                target.agent_id,
                InboundMessage::TaskDelegation {
                    task_id,
                    from_agent: self.inner.id,
                    step: Box::new(step.clone()),
                },
            )
            .await;

        if let Err(e) = sent {
            // Undo: restore local ownership so the step can run here.
            step.current_owner = self.inner.id;
            let _ = self
                .inner
                .services
                .directory
                .update_step_location(
                    step.id,
                    StepLocation {
                        owner_agent_id: self.inner.id,
                        agent_host: self.inner.host.clone(),
                    },
                )
                .await;
            self.inner.steps.write().await.push(step);
            return Err(e);
        }

        step.status = StepStatus::SubPlanRunning;
        self.inner
            .pending_delegations
            .lock()
            .await
            .insert(task_id, step);

        info!(
            agent = %self.inner.id,
            step = %step_id,
            target = %target.agent_id,
            role,
            "step delegated"
        );
        Ok(())
    }

    /// Find an active agent of `role` in this mission, or request one and
    /// poll until it reports `Running` (bounded).
    async fn find_or_provision(&self, role: &str) -> KernelResult<AgentInfo> {
        if let Some(info) = self
            .inner
            .services
            .directory
            .find_agent(self.inner.mission_id, role)
            .await?
            && info.state == AgentState::Running
        {
            return Ok(info);
        }

        let requested = self
            .inner
            .services
            .directory
            .request_agent(self.inner.mission_id, role)
            .await?;
        if requested.state == AgentState::Running {
            return Ok(requested);
        }

        let deadline = Duration::from_secs(self.inner.config.provision_poll_secs);
        let started = tokio::time::Instant::now();
        while started.elapsed() < deadline {
            sleep(Duration::from_millis(PROVISION_POLL_INTERVAL_MS)).await;
            if let Some(info) = self
                .inner
                .services
                .directory
                .agent_info(requested.agent_id)
                .await?
                && info.state == AgentState::Running
            {
                return Ok(info);
            }
        }
        Err(KernelError::Delegation(format!(
            "agent of role '{role}' did not become available within {}s",
            self.inner.config.provision_poll_secs
        )))
    }

    /// Accept (or reject) a step delegated by another agent.
    pub(crate) async fn accept_delegation(&self, task_id: Uuid, from_agent: Uuid, mut step: Step) {
        let state = *self.inner.state.read().await;
        if state.is_terminal() {
            warn!(agent = %self.inner.id, task = %task_id, "rejecting delegation: agent is terminal");
            self.inner
                .publisher
                .send_to_agent(
                    from_agent,
                    InboundMessage::TaskResult {
                        task_id,
                        outputs: vec![],
                        error: Some(format!("agent {} is {state}", self.inner.id)),
                    },
                )
                .await;
            return;
        }

        step.current_owner = self.inner.id;
        step.status = StepStatus::Pending;
        let step_id = step.id;

        let _ = self
            .inner
            .services
            .directory
            .update_step_location(
                step_id,
                StepLocation {
                    owner_agent_id: self.inner.id,
                    agent_host: self.inner.host.clone(),
                },
            )
            .await;

        self.inner
            .delegated_inbound
            .lock()
            .await
            .insert(step_id, (task_id, from_agent));
        self.push_steps(vec![step]).await;
        info!(agent = %self.inner.id, step = %step_id, from = %from_agent, "delegation accepted");
    }

    /// Close the loop on a previously delegated task.
    pub(crate) async fn handle_task_result(
        &self,
        task_id: Uuid,
        outputs: Vec<OutputRecord>,
        error: Option<String>,
    ) {
        let Some(mut mirror) = self.inner.pending_delegations.lock().await.remove(&task_id)
        else {
            warn!(agent = %self.inner.id, task = %task_id, "task result for unknown delegation");
            return;
        };
        let step_id = mirror.id;

        match error {
            None => {
                mirror.result = outputs;
                mirror.status = StepStatus::Completed;
                mirror.updated_at = chrono::Utc::now();
                self.inner.steps.write().await.push(mirror);
                self.inner
                    .publisher
                    .step_event(
                        step_id,
                        StepEventKind::StatusChanged {
                            from: StepStatus::SubPlanRunning,
                            to: StepStatus::Completed,
                        },
                    )
                    .await;
                info!(agent = %self.inner.id, step = %step_id, "delegated step completed remotely");
            }
            Some(message) => {
                mirror.last_error = Some(message.clone());
                mirror.status = StepStatus::Error;
                mirror.updated_at = chrono::Utc::now();
                let verb = mirror.verb.clone();
                self.inner.steps.write().await.push(mirror);
                warn!(agent = %self.inner.id, step = %step_id, error = %message,
                    "delegated step failed remotely");
                self.route_failure(
                    step_id,
                    ErrorSignal::message(message).with_code(code::PERMANENT),
                    &verb,
                )
                .await;
            }
        }
    }
}
