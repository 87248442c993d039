//! Lifecycle management: pause, abort, resume, and periodic checkpointing.
//!
//! Pause and abort revoke the agent's cancellation scope, which every
//! in-flight primitive execution and reasoning call observes cooperatively.
//! Resume acquires a fresh scope and re-enters the run loop. Checkpoints
//! serialize the full agent snapshot at a configurable interval; checkpoint
//! failures are logged and never stop execution.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use troupe_kernel::agent::{AgentSnapshot, AgentState};
use troupe_kernel::error::KernelResult;
use troupe_kernel::step::StepStatus;

use crate::agent::Agent;

impl Agent {
    /// Suspend execution: cancel in-flight work, park pending steps, persist
    /// a snapshot, and transition to `Paused`.
    ///
    /// Steps already in `Waiting` keep their pending user requests; answers
    /// arriving while paused are applied by the message handler and picked up
    /// on resume.
    pub async fn pause(&self) -> KernelResult<()> {
        {
            let mut state = self.inner.state.write().await;
            *state = state.transition_to(AgentState::Paused, self.inner.id)?;
        }
        self.stop_checkpoint_timer().await;
        self.inner.cancel.lock().await.cancel();

        {
            let mut steps = self.inner.steps.write().await;
            for step in steps.iter_mut() {
                if step.status == StepStatus::Pending {
                    let _ = step.transition(StepStatus::Paused);
                }
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(agent = %self.inner.id, error = %e, "pause snapshot failed");
        }
        self.inner
            .publisher
            .agent_state(AgentState::Paused, self.statistics().await)
            .await;
        info!(agent = %self.inner.id, "agent paused");
        Ok(())
    }

    /// Terminate execution permanently. Identical to pause, except the
    /// terminal state is `Aborted` and outstanding steps are cancelled.
    pub async fn abort(&self) -> KernelResult<()> {
        {
            let mut state = self.inner.state.write().await;
            *state = state.transition_to(AgentState::Aborted, self.inner.id)?;
        }
        self.stop_checkpoint_timer().await;
        self.inner.cancel.lock().await.cancel();
        self.inner.pending_questions.lock().await.clear();

        {
            let mut steps = self.inner.steps.write().await;
            for step in steps.iter_mut() {
                if matches!(
                    step.status,
                    StepStatus::Pending
                        | StepStatus::Running
                        | StepStatus::Waiting
                        | StepStatus::Paused
                        | StepStatus::SubPlanRunning
                ) {
                    let _ = step.transition(StepStatus::Cancelled);
                }
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(agent = %self.inner.id, error = %e, "abort snapshot failed");
        }
        self.inner
            .publisher
            .agent_state(AgentState::Aborted, self.statistics().await)
            .await;
        info!(agent = %self.inner.id, "agent aborted");
        Ok(())
    }

    /// Re-enter execution from `Paused` (or `Initializing`, after a snapshot
    /// restore). Acquires a fresh cancellation scope and reinstates the
    /// checkpoint timer.
    pub async fn resume(&self) -> KernelResult<()> {
        {
            let mut state = self.inner.state.write().await;
            *state = state.transition_to(AgentState::Running, self.inner.id)?;
        }
        *self.inner.cancel.lock().await = CancellationToken::new();

        {
            let outstanding: std::collections::HashSet<uuid::Uuid> = self
                .inner
                .pending_questions
                .lock()
                .await
                .values()
                .copied()
                .collect();
            let mut steps = self.inner.steps.write().await;
            for step in steps.iter_mut() {
                match step.status {
                    StepStatus::Paused => {
                        let _ = step.transition(StepStatus::Pending);
                    }
                    // Interrupted executions parked without a request go
                    // back to the queue; real user questions stay waiting.
                    StepStatus::Waiting if !outstanding.contains(&step.id) => {
                        step.status = StepStatus::Pending;
                        step.updated_at = chrono::Utc::now();
                    }
                    _ => {}
                }
            }
        }

        self.start_checkpoint_timer().await;
        self.inner
            .publisher
            .agent_state(AgentState::Running, self.statistics().await)
            .await;
        info!(agent = %self.inner.id, "agent resumed");
        Ok(())
    }

    /// Serialize and persist the full agent snapshot.
    pub async fn checkpoint(&self) -> KernelResult<()> {
        let snapshot = self.snapshot().await;
        self.inner.services.persistence.save_snapshot(&snapshot).await
    }

    /// Capture all non-derived state.
    pub async fn snapshot(&self) -> AgentSnapshot {
        let state = *self.inner.state.read().await;
        let steps = self.inner.steps.read().await.clone();
        let conversation = self.inner.conversation.read().await.clone();
        let (reflection_done, replan_depth) = {
            let reflection = self.inner.reflection.lock().await;
            (reflection.reflection_done, reflection.replan_depth)
        };
        AgentSnapshot {
            agent_id: self.inner.id,
            mission_id: self.inner.mission_id,
            role: self.inner.role.clone(),
            state,
            config: self.inner.config.clone(),
            steps,
            conversation,
            reflection_done,
            replan_depth,
            taken_at: chrono::Utc::now(),
        }
    }

    pub(crate) async fn start_checkpoint_timer(&self) {
        let minutes = self.inner.config.checkpoint_minutes;
        if minutes == 0 {
            return;
        }
        let agent = self.clone();
        let cancel = self.inner.cancel.lock().await.clone();
        let handle = tokio::spawn(async move {
            let period = Duration::from_secs(minutes * 60);
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = agent.checkpoint().await {
                            warn!(agent = %agent.id(), error = %e, "periodic checkpoint failed");
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.inner.checkpoint_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) async fn stop_checkpoint_timer(&self) {
        if let Some(handle) = self.inner.checkpoint_task.lock().await.take() {
            handle.abort();
        }
    }
}
