//! Step data model
//!
//! A [`Step`] is the unit of work owned by exactly one agent at a time. Steps
//! form a dependency DAG within an agent; the runtime scheduler dispatches
//! steps whose dependencies are satisfied and records their results as ordered
//! lists of named [`OutputRecord`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::KernelError;

/// Well-known action verbs understood by the execution core itself.
///
/// Anything not listed here is a primitive verb dispatched to the external
/// capability service. The set is deliberately open: routing happens on
/// string match, not on an enum.
pub mod verb {
    /// Root planning verb: decompose a mission goal into a plan.
    pub const ACCOMPLISH: &str = "ACCOMPLISH";
    /// Free-form reasoning call.
    pub const THINK: &str = "THINK";
    /// Failure / end-of-mission reflection.
    pub const REFLECT: &str = "REFLECT";
    /// Echo resolved inputs back as deliverable outputs.
    pub const RETURN: &str = "RETURN";
    /// Ask the user a question and wait for the answer.
    pub const ASK_USER: &str = "ASK_USER";

    pub const DECIDE: &str = "DECIDE";
    pub const REPEAT: &str = "REPEAT";
    pub const SEQUENCE: &str = "SEQUENCE";
    pub const WHILE: &str = "WHILE";
    pub const UNTIL: &str = "UNTIL";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const FOREACH: &str = "FOREACH";
    pub const REGROUP: &str = "REGROUP";

    /// Control-flow verbs that expand into new steps instead of doing work.
    pub const CONTROL_FLOW: &[&str] = &[
        DECIDE, REPEAT, SEQUENCE, WHILE, UNTIL, TIMEOUT, FOREACH, REGROUP,
    ];

    /// Verbs answered by the reasoning service rather than the capability
    /// service. These carry the longer planning deadline.
    pub const REASONING: &[&str] = &[ACCOMPLISH, THINK, REFLECT];

    pub fn is_control_flow(v: &str) -> bool {
        CONTROL_FLOW.contains(&v)
    }

    pub fn is_reasoning(v: &str) -> bool {
        REASONING.contains(&v)
    }
}

// ---------------------------------------------------------------------------
// Step Status
// ---------------------------------------------------------------------------

/// Status of a single step during execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum StepStatus {
    /// Waiting for dependencies; eligible for dispatch once they are met.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully with a non-empty result.
    Completed,
    /// Failed permanently.
    Error,
    /// Suspended by an agent pause.
    Paused,
    /// Cancelled by deadlock detection, branch abandonment, or abort.
    Cancelled,
    /// Parked until an external answer arrives (user input, signal).
    Waiting,
    /// Superseded by a recovery plan.
    Replaced,
    /// Ownership handed to another agent; completion arrives as a message.
    SubPlanRunning,
}

impl StepStatus {
    /// Returns `true` once the step can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Cancelled | Self::Replaced
        )
    }

    /// Returns `true` while the step still represents outstanding work.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Paused)
    }

    /// Legal transitions out of `Running`. Everything else is a programming
    /// error surfaced as [`KernelError::IllegalTransition`].
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        use StepStatus::*;
        match self {
            Running => matches!(
                target,
                Completed | Error | Waiting | SubPlanRunning | Cancelled
            ),
            // Pending steps may be picked up, parked, cancelled, paused,
            // replaced, or handed off before ever running. Control-flow
            // expansion is instantaneous and completes straight from
            // Pending, without an observable Running window.
            Pending => matches!(
                target,
                Running
                    | Completed
                    | Cancelled
                    | Paused
                    | Waiting
                    | Replaced
                    | SubPlanRunning
                    | Error
            ),
            Waiting => matches!(target, Pending | Completed | Cancelled | Error | Paused),
            Paused => matches!(target, Pending | Cancelled),
            SubPlanRunning => matches!(target, Completed | Error | Cancelled),
            // Terminal states only ever move to Replaced (recovery planning).
            Error => matches!(target, Replaced | Pending),
            Completed | Cancelled | Replaced => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Waiting => "waiting",
            Self::Replaced => "replaced",
            Self::SubPlanRunning => "sub_plan_running",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Output records
// ---------------------------------------------------------------------------

/// Shape of one named output value.
///
/// Three variants carry distinguished scheduler semantics: `Plan` results are
/// assembled into new steps, `PendingUserInput` parks the step in `Waiting`,
/// and `Error` routes through the failure classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ResultType {
    Plan,
    PendingUserInput,
    Error,
    String,
    Object,
    Array,
    Number,
    Boolean,
}

impl ResultType {
    /// Infer the plain-data result type for an arbitrary JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Null => Self::String,
        }
    }
}

/// One named output of a completed (or failed) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Name by which successors address this output.
    pub name: String,
    /// Distinguished shape of the value.
    pub result_type: ResultType,
    /// The payload.
    pub result: Value,
    /// Optional MIME type, set for file-like deliverables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Marks the record as a mission deliverable to be attached to the
    /// outgoing work-product update.
    #[serde(default)]
    pub is_deliverable: bool,
}

impl OutputRecord {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            result_type: ResultType::of(&value),
            result: value,
            mime_type: None,
            is_deliverable: false,
        }
    }

    /// A plan-typed record whose payload is an array of task descriptions.
    pub fn plan(name: impl Into<String>, tasks: Value) -> Self {
        Self {
            name: name.into(),
            result_type: ResultType::Plan,
            result: tasks,
            mime_type: None,
            is_deliverable: false,
        }
    }

    /// An error-typed record carrying a failure message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            name: "error".into(),
            result_type: ResultType::Error,
            result: Value::String(message.into()),
            mime_type: None,
            is_deliverable: false,
        }
    }

    /// A pending-user-input record carrying the request correlation id.
    pub fn pending_user_input(request_id: Uuid) -> Self {
        Self {
            name: "request_id".into(),
            result_type: ResultType::PendingUserInput,
            result: Value::String(request_id.to_string()),
            mime_type: None,
            is_deliverable: false,
        }
    }

    pub fn deliverable(mut self) -> Self {
        self.is_deliverable = true;
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Input references and dependencies
// ---------------------------------------------------------------------------

/// Addresses the producer of a referenced output.
///
/// `Parent` is the `sourceStep = 0` convention: the value is looked up in the
/// parent scope (the expanding control-flow step's resolved inputs). It
/// serializes as the literal `0`, step ids as their UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepRef {
    Step(Uuid),
    Parent,
}

impl StepRef {
    pub fn is_parent(&self) -> bool {
        matches!(self, Self::Parent)
    }

    pub fn step_id(&self) -> Option<Uuid> {
        match self {
            Self::Step(id) => Some(*id),
            Self::Parent => None,
        }
    }
}

impl Serialize for StepRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Parent => serializer.serialize_u64(0),
            Self::Step(id) => serializer.serialize_str(&id.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for StepRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        match Value::deserialize(deserializer)? {
            Value::Number(n) if n.as_u64() == Some(0) => Ok(Self::Parent),
            Value::String(s) => Uuid::parse_str(&s)
                .map(Self::Step)
                .map_err(|e| D::Error::custom(format!("invalid step reference '{s}': {e}"))),
            other => Err(D::Error::custom(format!(
                "step reference must be 0 or a UUID string, got {other}"
            ))),
        }
    }
}

/// One entry in a step's input-reference map: either a literal value or a
/// pointer to another step's named output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Literal(Value),
    Output {
        source_step: StepRef,
        output_name: String,
    },
}

impl InputSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn output(source_step: StepRef, output_name: impl Into<String>) -> Self {
        Self::Output {
            source_step,
            output_name: output_name.into(),
        }
    }
}

/// Prefix that marks a dependency as signal-only: the consumer requires the
/// source to complete but reads no named output from it.
pub const SIGNAL_PREFIX: &str = "__";

/// Reserved input-name prefix recorded by the resolver when a required
/// dependency cannot be hydrated.
pub const FAILED_INPUT_PREFIX: &str = "__failed_";

/// A dependency edge `{source, output, input}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub source_step: StepRef,
    pub output_name: String,
    pub input_name: String,
}

impl Dependency {
    pub fn new(
        source_step: StepRef,
        output_name: impl Into<String>,
        input_name: impl Into<String>,
    ) -> Self {
        Self {
            source_step,
            output_name: output_name.into(),
            input_name: input_name.into(),
        }
    }

    /// Signal-only dependencies require only completion of the source.
    pub fn is_signal(&self) -> bool {
        self.input_name.starts_with(SIGNAL_PREFIX)
            && !self.input_name.starts_with(FAILED_INPUT_PREFIX)
    }
}

// ---------------------------------------------------------------------------
// Delegation
// ---------------------------------------------------------------------------

/// Append-only record of one ownership transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub from_agent: Uuid,
    pub to_agent: Uuid,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub transfer_id: Uuid,
}

impl DelegationRecord {
    pub fn new(from_agent: Uuid, to_agent: Uuid, reason: impl Into<String>) -> Self {
        Self {
            from_agent,
            to_agent,
            timestamp: Utc::now(),
            reason: reason.into(),
            transfer_id: Uuid::new_v4(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// The central entity of the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable identifier.
    pub id: Uuid,
    /// Mission this step belongs to. Carried onto every event and
    /// work-product derived from the step.
    pub mission_id: Uuid,
    /// The control-flow or planner step that produced this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Groups steps emitted by the same control-flow expansion (notably one
    /// `FOREACH` instance) for later aggregation via `REGROUP`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<Uuid>,

    /// Action verb identifying the operation.
    pub verb: String,
    /// Human-readable description, used in reflection prompts.
    #[serde(default)]
    pub description: String,

    /// Declared inputs: name → literal or output reference.
    #[serde(default)]
    pub input_refs: HashMap<String, InputSource>,
    /// Resolved runtime inputs, populated by the resolver immediately before
    /// execution. Not part of the durable identity of the step.
    #[serde(default)]
    pub input_values: HashMap<String, Value>,
    /// Ordered dependency edges.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Custom names under which this step's outputs are exposed, mapped to a
    /// short description of each.
    #[serde(default)]
    pub outputs: HashMap<String, String>,

    pub status: StepStatus,
    /// Ordered named output records. Non-empty once `Completed`.
    #[serde(default)]
    pub result: Vec<OutputRecord>,

    /// The agent that created the step.
    pub original_owner: Uuid,
    /// The agent currently responsible for executing it.
    pub current_owner: Uuid,
    #[serde(default)]
    pub delegation_history: Vec<DelegationRecord>,
    /// Role label suggesting a specialised agent should run this step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_role: Option<String>,

    /// Transient-failure retry counter.
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// Data-shape failure retry counter.
    #[serde(default)]
    pub recoverable_retry_count: u32,
    pub max_recoverable_retries: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
    /// Per-step wall-clock deadline in milliseconds, stamped by a `TIMEOUT`
    /// parent. Overrides the verb-class default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Durable iteration cursor for batched `FOREACH` execution.
    #[serde(default)]
    pub current_index: usize,
    /// Identifier of the external event this step is parked on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaits_signal: Option<Uuid>,

    /// Earliest dispatch instant (epoch ms) after a backoff. Runtime-only.
    #[serde(skip)]
    pub backoff_until_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    /// Create a pending step owned by `owner` within `mission_id`.
    pub fn new(mission_id: Uuid, owner: Uuid, verb: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mission_id,
            parent_id: None,
            scope_id: None,
            verb: verb.into(),
            description: String::new(),
            input_refs: HashMap::new(),
            input_values: HashMap::new(),
            dependencies: Vec::new(),
            outputs: HashMap::new(),
            status: StepStatus::Pending,
            result: Vec::new(),
            original_owner: owner,
            current_owner: owner,
            delegation_history: Vec::new(),
            recommended_role: None,
            retry_count: 0,
            max_retries: 3,
            recoverable_retry_count: 0,
            max_recoverable_retries: 5,
            last_error: None,
            error_context: None,
            timeout_ms: None,
            current_index: 0,
            awaits_signal: None,
            backoff_until_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_scope(mut self, scope_id: Uuid) -> Self {
        self.scope_id = Some(scope_id);
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, source: InputSource) -> Self {
        self.input_refs.insert(name.into(), source);
        self
    }

    pub fn with_dependency(mut self, dep: Dependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), description.into());
        self
    }

    pub fn with_recommended_role(mut self, role: impl Into<String>) -> Self {
        self.recommended_role = Some(role.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Whether the step currently lives on another agent.
    pub fn is_remotely_owned(&self, local_agent: Uuid) -> bool {
        self.current_owner != local_agent
    }

    /// Guarded status transition. Illegal transitions are programming errors
    /// and return [`KernelError::IllegalTransition`].
    pub fn transition(&mut self, target: StepStatus) -> Result<(), KernelError> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(KernelError::IllegalTransition {
                step_id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a successful result and complete the step.
    ///
    /// Every name declared in `outputs` must appear in `records`; a missing
    /// entry violates the completion invariant and is rejected.
    pub fn complete(&mut self, records: Vec<OutputRecord>) -> Result<(), KernelError> {
        if records.is_empty() {
            return Err(KernelError::EmptyResult { step_id: self.id });
        }
        for declared in self.outputs.keys() {
            if !records.iter().any(|r| &r.name == declared) {
                return Err(KernelError::MissingDeclaredOutput {
                    step_id: self.id,
                    output: declared.clone(),
                });
            }
        }
        self.result = records;
        self.transition(StepStatus::Completed)
    }

    /// Look up a named output record of a completed step.
    pub fn output(&self, name: &str) -> Option<&OutputRecord> {
        self.result.iter().find(|r| r.name == name)
    }

    /// Whether any transient retry budget remains.
    pub fn can_retry_transient(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether any recoverable retry budget remains.
    pub fn can_retry_recoverable(&self) -> bool {
        self.recoverable_retry_count < self.max_recoverable_retries
    }

    /// Drop bulky payloads of a terminal step while keeping the output names
    /// and types intact. The persisted work-product retains the full payload.
    pub fn prune(&mut self) {
        if !self.status.is_terminal() {
            return;
        }
        for record in &mut self.result {
            record.result = Value::Null;
        }
        self.input_values.clear();
        self.error_context = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
