//! Agent configuration.

use serde::{Deserialize, Serialize};

/// Per-agent configuration knobs.
///
/// All defaults match the platform-wide constants; individual agents may be
/// tuned through the builder setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Transient-failure retries per step.
    pub max_retries: u32,
    /// Data-shape failure retries per step.
    pub max_recoverable_retries: u32,
    /// Reflective replans before the agent gives up.
    pub max_replan_depth: u32,
    /// Consecutive identical reflection plan signatures tolerated before the
    /// agent fails with an infinite-reflection-loop error.
    pub max_reflect_cycles_per_error: u32,
    /// Minutes between periodic snapshot checkpoints while running.
    pub checkpoint_minutes: u64,
    /// Default wall-clock deadline for primitive verb execution.
    pub primitive_step_timeout_ms: u64,
    /// Default wall-clock deadline for planning-type verbs.
    pub planning_step_timeout_ms: u64,
    /// Initial transient-retry backoff; doubles per attempt.
    pub default_backoff_ms: u64,
    /// Upper bound on `WHILE`/`UNTIL` loop iterations.
    pub loop_body_safety_cap: u32,
    /// Default `FOREACH` batch size cap when the step declares none.
    pub foreach_default_batch_cap: usize,
    /// Seconds to poll for a newly provisioned delegation target.
    pub provision_poll_secs: u64,
    /// Idle sleep between scheduler sweeps when nothing is ready.
    pub idle_sweep_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_recoverable_retries: 5,
            max_replan_depth: 3,
            max_reflect_cycles_per_error: 3,
            checkpoint_minutes: 15,
            primitive_step_timeout_ms: 1_800_000,
            planning_step_timeout_ms: 3_600_000,
            default_backoff_ms: 1_000,
            loop_body_safety_cap: 100,
            foreach_default_batch_cap: 25,
            provision_poll_secs: 30,
            idle_sweep_ms: 1_000,
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_max_recoverable_retries(mut self, max: u32) -> Self {
        self.max_recoverable_retries = max;
        self
    }

    pub fn with_max_replan_depth(mut self, max: u32) -> Self {
        self.max_replan_depth = max;
        self
    }

    pub fn with_checkpoint_minutes(mut self, minutes: u64) -> Self {
        self.checkpoint_minutes = minutes;
        self
    }

    pub fn with_default_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.default_backoff_ms = backoff_ms;
        self
    }

    pub fn with_idle_sweep_ms(mut self, idle_ms: u64) -> Self {
        self.idle_sweep_ms = idle_ms;
        self
    }

    /// Default deadline for a verb: planning verbs get the long budget,
    /// everything else the primitive one.
    pub fn default_timeout_ms(&self, verb: &str) -> u64 {
        if crate::step::verb::is_reasoning(verb) {
            self.planning_step_timeout_ms
        } else {
            self.primitive_step_timeout_ms
        }
    }

    /// Geometric backoff delay for the given (0-based) retry attempt.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.default_backoff_ms.saturating_mul(1u64 << attempt.min(16))
    }
}
