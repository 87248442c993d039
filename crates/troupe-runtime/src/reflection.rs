//! Reflection management.
//!
//! Two jobs: producing `REFLECT` steps (on step failure, and once at end of
//! mission) and interpreting their outputs. A sha256 signature over each
//! proposed plan detects reflection cycles: the same plan proposed repeatedly
//! means the reasoning service is stuck, and the agent fails rather than
//! looping forever.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use troupe_kernel::config::AgentConfig;
use troupe_kernel::plan::PlanDescription;
use troupe_kernel::step::{InputSource, OutputRecord, ResultType, Step, verb};

/// Reserved input distinguishing failure reflection from end-of-mission
/// reflection on a `REFLECT` step.
pub const PHASE_INPUT: &str = "phase";
pub const PHASE_FAILURE: &str = "failure";
pub const PHASE_MISSION: &str = "mission";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Mutable reflection bookkeeping for one agent.
#[derive(Debug, Default)]
pub struct ReflectionState {
    /// Current reflective replan depth. Bounded by `max_replan_depth`,
    /// decremented on every successful step so intermittent recovery does
    /// not permanently exhaust the budget.
    pub replan_depth: u32,
    /// End-of-mission reflection guard.
    pub reflection_done: bool,
    /// Steps that already went through a failure replan.
    pub replanned_steps: HashSet<Uuid>,
    /// Failure counts per verb, for the repeated-same-verb loop break.
    pub failed_verbs: HashMap<String, u32>,
    /// Total replans over the agent's lifetime (statistics).
    pub total_replans: u32,
    last_signature: Option<String>,
    consecutive_signature_count: u32,
}

impl ReflectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a proposed plan's signature. Returns `true` when the same
    /// signature has now been seen `max_reflect_cycles_per_error` times in a
    /// row, which means the reflection loop is stuck.
    pub fn note_signature(&mut self, signature: String, config: &AgentConfig) -> bool {
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.consecutive_signature_count += 1;
        } else {
            self.last_signature = Some(signature);
            self.consecutive_signature_count = 1;
        }
        self.consecutive_signature_count >= config.max_reflect_cycles_per_error
    }

    /// A step succeeded; pay back one unit of replan budget.
    pub fn note_success(&mut self) {
        self.replan_depth = self.replan_depth.saturating_sub(1);
    }

    /// Record a failure of `verb`. Returns the failure count so far.
    pub fn note_verb_failure(&mut self, verb: &str) -> u32 {
        let count = self.failed_verbs.entry(verb.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Whether another failure replan is allowed for this step.
    pub fn may_replan(&self, step: &Step, config: &AgentConfig) -> ReplanDecision {
        if self.replanned_steps.contains(&step.id) {
            return ReplanDecision::AlreadyReplanned;
        }
        if self.replan_depth >= config.max_replan_depth {
            return ReplanDecision::DepthSaturated;
        }
        // Loop-break heuristic: more than two failures of the same verb.
        if self
            .failed_verbs
            .get(&step.verb)
            .is_some_and(|count| *count > 2)
        {
            return ReplanDecision::VerbLoop;
        }
        ReplanDecision::Allowed
    }
}

/// Outcome of the replan admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanDecision {
    Allowed,
    AlreadyReplanned,
    DepthSaturated,
    VerbLoop,
}

impl ReplanDecision {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::AlreadyReplanned => "step was already replanned",
            Self::DepthSaturated => "replan depth saturated",
            Self::VerbLoop => "repeated failures of the same verb",
        }
    }
}

// ---------------------------------------------------------------------------
// Plan signatures
// ---------------------------------------------------------------------------

/// Hash of the verbs, truncated descriptions, and sorted input-name sets of a
/// plan. Two plans with the same signature are treated as the same proposal.
pub fn plan_signature(plan: &PlanDescription) -> String {
    let mut hasher = Sha256::new();
    for task in &plan.tasks {
        hasher.update(task.verb.as_bytes());
        hasher.update(b"|");
        let description: String = task.description.chars().take(64).collect();
        hasher.update(description.as_bytes());
        hasher.update(b"|");
        let mut input_names: Vec<&str> = task.inputs.keys().map(|s| s.as_str()).collect();
        input_names.sort_unstable();
        for name in input_names {
            hasher.update(name.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b";");
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// REFLECT step construction
// ---------------------------------------------------------------------------

/// Build the `REFLECT` step for a failed step.
pub fn failure_reflect_step(failed: &Step, error: &str, work_summary: String) -> Step {
    Step::new(failed.mission_id, failed.current_owner, verb::REFLECT)
        .with_description(format!("recover from failure of {}", failed.verb))
        .with_input(PHASE_INPUT, InputSource::literal(json!(PHASE_FAILURE)))
        .with_input("failed_verb", InputSource::literal(json!(failed.verb)))
        .with_input(
            "failed_description",
            InputSource::literal(json!(failed.description)),
        )
        .with_input("error", InputSource::literal(json!(error)))
        .with_input("completed_work", InputSource::literal(json!(work_summary)))
}

/// Build the single end-of-mission `REFLECT` step.
pub fn mission_reflect_step(
    mission_id: Uuid,
    owner: Uuid,
    plan_history: Value,
    work_summary: String,
) -> Step {
    Step::new(mission_id, owner, verb::REFLECT)
        .with_description("review mission outcome")
        .with_input(PHASE_INPUT, InputSource::literal(json!(PHASE_MISSION)))
        .with_input("plan_history", InputSource::literal(plan_history))
        .with_input("completed_work", InputSource::literal(json!(work_summary)))
}

/// Which reflection phase a `REFLECT` step belongs to.
pub fn reflect_phase(step: &Step) -> &'static str {
    match step.input_refs.get(PHASE_INPUT) {
        Some(InputSource::Literal(Value::String(phase))) if phase == PHASE_MISSION => {
            PHASE_MISSION
        }
        _ => PHASE_FAILURE,
    }
}

// ---------------------------------------------------------------------------
// Output interpretation
// ---------------------------------------------------------------------------

/// What a completed `REFLECT` step asks the scheduler to do.
#[derive(Debug, Clone)]
pub enum ReflectionVerdict {
    /// Append the plan as new steps.
    NewPlan(PlanDescription),
    /// Nothing left to do: the mission is accomplished.
    MissionAccomplished,
    /// Pursue a direct answer via a fresh `ACCOMPLISH` step.
    DirectAnswer(String),
    /// No actionable output; continue as-is.
    Continue,
}

/// Interpret a `REFLECT` step's result records.
///
/// Two overlapping shapes are accepted: a `plan`-typed output, and an
/// `answer` string that may itself be a JSON plan. The path taken is logged.
pub fn interpret(records: &[OutputRecord]) -> ReflectionVerdict {
    // Preferred: an explicit plan output.
    for record in records {
        let is_plan_shaped =
            record.result_type == ResultType::Plan || record.name == "plan";
        if is_plan_shaped && record.result.is_array() {
            debug!("reflection produced a plan output");
            return match PlanDescription::from_value(&record.result) {
                Ok(plan) if plan.is_empty() => ReflectionVerdict::MissionAccomplished,
                Ok(plan) => ReflectionVerdict::NewPlan(plan),
                Err(e) => {
                    debug!(error = %e, "plan output did not parse; continuing as-is");
                    ReflectionVerdict::Continue
                }
            };
        }
    }

    if let Some(record) = records.iter().find(|r| r.name == "direct_answer")
        && let Value::String(goal) = &record.result
    {
        debug!("reflection produced a direct answer");
        return ReflectionVerdict::DirectAnswer(goal.clone());
    }

    // Fallback: an answer string that parses as a JSON plan.
    if let Some(record) = records.iter().find(|r| r.name == "answer")
        && let Value::String(answer) = &record.result
    {
        if let Ok(value) = serde_json::from_str::<Value>(answer)
            && value.is_array()
        {
            debug!("reflection answer string parsed as a plan");
            return match PlanDescription::from_value(&value) {
                Ok(plan) if plan.is_empty() => ReflectionVerdict::MissionAccomplished,
                Ok(plan) => ReflectionVerdict::NewPlan(plan),
                Err(_) => ReflectionVerdict::Continue,
            };
        }
        debug!("reflection answer is plain text; continuing as-is");
    }

    ReflectionVerdict::Continue
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
