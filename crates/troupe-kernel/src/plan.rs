//! Plan descriptions
//!
//! A [`PlanDescription`] is the data produced by planning and reflection steps:
//! an ordered list of task descriptions whose dependencies may be addressed by
//! task identifier or by ordinal position. The runtime assembler turns a
//! validated description into wired [`Step`](crate::step::Step)s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::{KernelError, KernelResult};

// ---------------------------------------------------------------------------
// Task references
// ---------------------------------------------------------------------------

/// Addresses another task within a plan, or the parent scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskRef {
    /// Ordinal position within the plan's task list (0-based).
    Ordinal(usize),
    /// A task-supplied identifier.
    Id(String),
}

impl TaskRef {
    /// The parent-scope convention: ordinal `0` addresses the expanding
    /// step's own resolved inputs, never the first task. Task lists are
    /// therefore 1-based when addressed ordinally.
    pub fn is_parent(&self) -> bool {
        matches!(self, Self::Ordinal(0))
    }

    /// An id that parses as a UUID addresses an already-instantiated step
    /// outside this plan (loop continuations reference prior iterations this
    /// way). Such references bypass intra-plan validation; the assembler
    /// flags unknown ones as potential cross-agent dependencies.
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Id(id) if uuid::Uuid::parse_str(id).is_ok())
    }

    /// The external step id, when [`TaskRef::is_external`] holds.
    pub fn external_id(&self) -> Option<uuid::Uuid> {
        match self {
            Self::Id(id) => uuid::Uuid::parse_str(id).ok(),
            Self::Ordinal(_) => None,
        }
    }
}

/// One declared input of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInput {
    /// A literal value copied into the step as-is.
    Literal(Value),
    /// A reference to another task's named output (or the parent scope).
    Output { task: TaskRef, output: String },
}

impl TaskInput {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn output(task: TaskRef, output: impl Into<String>) -> Self {
        Self::Output {
            task,
            output: output.into(),
        }
    }

    pub fn parent_output(output: impl Into<String>) -> Self {
        Self::Output {
            task: TaskRef::Ordinal(0),
            output: output.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// PlanTask
// ---------------------------------------------------------------------------

/// One task description within a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanTask {
    /// Optional task-supplied identifier, preserved for intra-plan
    /// dependency resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Action verb.
    pub verb: String,
    #[serde(default)]
    pub description: String,
    /// Declared inputs: name → literal or task-output reference.
    #[serde(default)]
    pub inputs: HashMap<String, TaskInput>,
    /// Explicit dependency edges in addition to those implied by inputs.
    /// Input names starting with `__` are signal-only.
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    /// Output names this task exposes, mapped to short descriptions.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// Role label suggesting delegation to a specialised agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_role: Option<String>,
    /// Wall-clock deadline stamped by a `TIMEOUT` parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// An explicit dependency edge between plan tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task: TaskRef,
    pub output: String,
    pub input: String,
}

impl PlanTask {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, input: TaskInput) -> Self {
        self.inputs.insert(name.into(), input);
        self
    }

    pub fn with_dependency(mut self, task: TaskRef, output: impl Into<String>, input: impl Into<String>) -> Self {
        self.dependencies.push(TaskDependency {
            task,
            output: output.into(),
            input: input.into(),
        });
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

    /// All task references this task makes, from inputs and explicit edges.
    pub fn references(&self) -> Vec<&TaskRef> {
        let mut refs: Vec<&TaskRef> = self
            .inputs
            .values()
            .filter_map(|input| match input {
                TaskInput::Output { task, .. } => Some(task),
                TaskInput::Literal(_) => None,
            })
            .collect();
        refs.extend(self.dependencies.iter().map(|d| &d.task));
        refs
    }
}

// ---------------------------------------------------------------------------
// PlanDescription
// ---------------------------------------------------------------------------

/// An ordered list of task descriptions produced by a planner or reflection
/// step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanDescription {
    pub tasks: Vec<PlanTask>,
}

impl PlanDescription {
    pub fn new(tasks: Vec<PlanTask>) -> Self {
        Self { tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Parse a plan from an arbitrary JSON value (a `Plan`-typed output
    /// record's payload).
    pub fn from_value(value: &Value) -> KernelResult<Self> {
        serde_json::from_value(value.clone()).map_err(KernelError::from)
    }

    /// Look up a task by its supplied identifier.
    pub fn task_by_id(&self, id: &str) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| t.id.as_deref() == Some(id))
    }

    /// Resolve a [`TaskRef`] to the ordinal of the referenced task.
    ///
    /// Ordinal references are 1-based (`0` is the parent scope). Returns
    /// `None` for parent references and for references that point outside the
    /// plan.
    pub fn resolve_ref(&self, task_ref: &TaskRef) -> Option<usize> {
        match task_ref {
            TaskRef::Ordinal(0) => None,
            TaskRef::Ordinal(n) => {
                let idx = n - 1;
                (idx < self.tasks.len()).then_some(idx)
            }
            TaskRef::Id(id) => self
                .tasks
                .iter()
                .position(|t| t.id.as_deref() == Some(id.as_str())),
        }
    }

    /// Validate the plan: duplicate ids, dangling intra-plan references, and
    /// dependency cycles all fail fast.
    ///
    /// Parent references (`0`) are legal here; whether a parent actually
    /// exists is checked by the assembler with the expansion context in hand.
    pub fn validate(&self) -> KernelResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for task in &self.tasks {
            if let Some(id) = task.id.as_deref()
                && !seen.insert(id)
            {
                return Err(KernelError::InvalidPlan(format!(
                    "duplicate task id '{id}'"
                )));
            }
        }

        for (ordinal, task) in self.tasks.iter().enumerate() {
            for task_ref in task.references() {
                if task_ref.is_parent() || task_ref.is_external() {
                    continue;
                }
                if self.resolve_ref(task_ref).is_none() {
                    return Err(KernelError::InvalidPlan(format!(
                        "task {} ('{}') references non-existent task {:?}",
                        ordinal + 1,
                        task.verb,
                        task_ref
                    )));
                }
            }
        }

        self.detect_cycles()
    }

    /// Cycle detection via Kahn's algorithm over intra-plan edges.
    fn detect_cycles(&self) -> KernelResult<()> {
        let n = self.tasks.len();
        let mut in_degree = vec![0usize; n];
        let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();

        for (idx, task) in self.tasks.iter().enumerate() {
            for task_ref in task.references() {
                if let Some(src) = self.resolve_ref(task_ref) {
                    adjacency.entry(src).or_default().push(idx);
                    in_degree[idx] += 1;
                }
            }
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop() {
            visited += 1;
            if let Some(children) = adjacency.get(&node) {
                for &child in children {
                    in_degree[child] -= 1;
                    if in_degree[child] == 0 {
                        queue.push(child);
                    }
                }
            }
        }

        if visited != n {
            return Err(KernelError::InvalidPlan(
                "plan dependency graph contains a cycle".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_task_plan() -> PlanDescription {
        PlanDescription::new(vec![
            PlanTask::new("THINK")
                .with_id("think")
                .with_output("answer", "the reasoning result"),
            PlanTask::new("RETURN")
                .with_input("answer", TaskInput::output(TaskRef::Id("think".into()), "answer"))
                .with_output("answer", "the final answer"),
        ])
    }

    #[test]
    fn valid_plan_passes() {
        assert!(two_task_plan().validate().is_ok());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let plan = PlanDescription::new(vec![
            PlanTask::new("A").with_id("x"),
            PlanTask::new("B").with_id("x"),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn dangling_reference_rejected() {
        let plan = PlanDescription::new(vec![PlanTask::new("A")
            .with_input("x", TaskInput::output(TaskRef::Id("missing".into()), "out"))]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("non-existent"));
    }

    #[test]
    fn dangling_ordinal_rejected() {
        let plan = PlanDescription::new(vec![PlanTask::new("A")
            .with_input("x", TaskInput::output(TaskRef::Ordinal(5), "out"))]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn parent_reference_is_legal() {
        let plan = PlanDescription::new(vec![PlanTask::new("ECHO")
            .with_input("item", TaskInput::parent_output("item"))]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn external_uuid_reference_is_legal() {
        let external = uuid::Uuid::new_v4().to_string();
        let plan = PlanDescription::new(vec![PlanTask::new("CALL")
            .with_input("x", TaskInput::output(TaskRef::Id(external.clone()), "out"))]);
        assert!(plan.validate().is_ok());
        assert!(TaskRef::Id(external).is_external());
        assert!(!TaskRef::Id("named-task".into()).is_external());
    }

    #[test]
    fn cycle_detected() {
        let plan = PlanDescription::new(vec![
            PlanTask::new("A")
                .with_id("a")
                .with_input("x", TaskInput::output(TaskRef::Id("b".into()), "out")),
            PlanTask::new("B")
                .with_id("b")
                .with_input("y", TaskInput::output(TaskRef::Id("a".into()), "out")),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn ordinals_are_one_based() {
        let plan = two_task_plan();
        assert_eq!(plan.resolve_ref(&TaskRef::Ordinal(1)), Some(0));
        assert_eq!(plan.resolve_ref(&TaskRef::Ordinal(2)), Some(1));
        assert_eq!(plan.resolve_ref(&TaskRef::Ordinal(0)), None);
        assert_eq!(plan.resolve_ref(&TaskRef::Ordinal(3)), None);
    }

    #[test]
    fn serde_round_trip_preserves_shape() {
        let plan = two_task_plan();
        let json = serde_json::to_value(&plan).unwrap();
        // Transparent serialization: a plan is just an array of tasks.
        assert!(json.is_array());
        let back = PlanDescription::from_value(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.tasks[0].id.as_deref(), Some("think"));
        assert_eq!(back.tasks[1].inputs.len(), 1);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn from_value_rejects_non_plan_shapes() {
        assert!(PlanDescription::from_value(&json!({"not": "a plan"})).is_err());
        assert!(PlanDescription::from_value(&json!([{"no_verb": true}])).is_err());
    }
}
