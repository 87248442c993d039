//! Control-flow verb execution.
//!
//! Control-flow verbs never perform external work: they expand new steps the
//! scheduler drives. Loop state lives in the emitted step records (and the
//! `FOREACH` iteration cursor), never on the Rust stack, so deeply nested
//! loops survive checkpointing.

use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use troupe_kernel::config::AgentConfig;
use troupe_kernel::error::{ErrorSignal, code};
use troupe_kernel::plan::{PlanDescription, PlanTask, TaskInput, TaskRef};
use troupe_kernel::step::{InputSource, OutputRecord, Step, StepStatus, verb};

/// Reserved input carrying the loop iteration counter on `WHILE`/`UNTIL`
/// continuation steps.
const ITERATION_INPUT: &str = "__iteration";

/// What a control-flow execution decided.
#[derive(Debug)]
pub enum VerbOutcome {
    /// The step completes; `plan` (possibly empty) is appended as new steps.
    Expand {
        plan: PlanDescription,
        records: Vec<OutputRecord>,
        /// Scope stamped onto the emitted steps. `FOREACH` propagates its own
        /// id; everything else inherits the expanding step's scope.
        scope: Option<Uuid>,
    },
    /// `FOREACH` emitted one batch and stays pending for the next sweep.
    InProgress {
        plan: PlanDescription,
        next_index: usize,
    },
    /// `REGROUP` members are not yet terminal; re-check next sweep.
    Defer,
    Fail(ErrorSignal),
}

impl VerbOutcome {
    fn expand(plan: PlanDescription, records: Vec<OutputRecord>, scope: Option<Uuid>) -> Self {
        Self::Expand {
            plan,
            records,
            scope,
        }
    }

    fn complete(records: Vec<OutputRecord>) -> Self {
        Self::Expand {
            plan: PlanDescription::default(),
            records,
            scope: None,
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::Fail(ErrorSignal::message(message).with_code(code::VALIDATION))
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self::Fail(ErrorSignal::message(message).with_code(code::PERMANENT))
    }
}

/// Execute one control-flow verb against the resolved inputs and the owning
/// agent's step list.
pub fn execute(
    step: &Step,
    inputs: &HashMap<String, Value>,
    steps: &[Step],
    config: &AgentConfig,
) -> VerbOutcome {
    match step.verb.as_str() {
        verb::DECIDE => decide(step, inputs),
        verb::REPEAT => repeat(step, inputs),
        verb::SEQUENCE => sequence(step, inputs),
        verb::WHILE => while_loop(step, inputs, config, false),
        verb::UNTIL => while_loop(step, inputs, config, true),
        verb::TIMEOUT => timeout(step, inputs),
        verb::FOREACH => foreach(step, inputs, config),
        verb::REGROUP => regroup(step, inputs, steps),
        other => VerbOutcome::permanent(format!("unsupported verb {other}")),
    }
}

// ---------------------------------------------------------------------------
// Simple expansions
// ---------------------------------------------------------------------------

fn decide(step: &Step, inputs: &HashMap<String, Value>) -> VerbOutcome {
    let Some(condition) = inputs.get("condition") else {
        return VerbOutcome::validation("DECIDE requires a 'condition' input");
    };
    let truthy = is_truthy(condition);
    let branch = if truthy { "trueSteps" } else { "falseSteps" };

    let plan = match inputs.get(branch) {
        Some(tasks) => match parse_plan(tasks) {
            Ok(plan) => plan,
            Err(e) => return VerbOutcome::validation(e),
        },
        None => PlanDescription::default(),
    };

    let records = vec![
        OutputRecord::new("condition_result", json!(truthy)),
        OutputRecord::plan("plan", plan_value(&plan)),
    ];
    VerbOutcome::expand(plan, records, step.scope_id)
}

fn repeat(step: &Step, inputs: &HashMap<String, Value>) -> VerbOutcome {
    let count = match inputs.get("count").and_then(Value::as_u64) {
        Some(count) => count as usize,
        None => return VerbOutcome::validation("REPEAT requires a numeric 'count' input"),
    };
    let template = match required_plan(inputs) {
        Ok(plan) => plan,
        Err(e) => return VerbOutcome::validation(e),
    };

    let mut tasks = Vec::with_capacity(count * template.len());
    for copy in 0..count {
        tasks.extend(instantiate(&template, copy, &HashMap::new()));
    }
    let plan = PlanDescription::new(tasks);

    let records = vec![
        OutputRecord::new("count", json!(count)),
        OutputRecord::plan("plan", plan_value(&plan)),
    ];
    VerbOutcome::expand(plan, records, step.scope_id)
}

fn sequence(step: &Step, inputs: &HashMap<String, Value>) -> VerbOutcome {
    let mut plan = match required_plan(inputs) {
        Ok(plan) => plan,
        Err(e) => return VerbOutcome::validation(e),
    };

    // Chain each task to its predecessor with a signal-only edge to force
    // linear order. Ordinals are 1-based.
    for idx in 1..plan.tasks.len() {
        plan.tasks[idx].dependencies.push(troupe_kernel::plan::TaskDependency {
            task: TaskRef::Ordinal(idx),
            output: "completed".into(),
            input: format!("__after_{idx}"),
        });
    }

    let records = vec![OutputRecord::plan("plan", plan_value(&plan))];
    VerbOutcome::expand(plan, records, step.scope_id)
}

fn timeout(step: &Step, inputs: &HashMap<String, Value>) -> VerbOutcome {
    let Some(timeout_ms) = inputs.get("timeout").and_then(Value::as_u64) else {
        return VerbOutcome::validation("TIMEOUT requires a numeric 'timeout' input");
    };
    let mut plan = match required_plan(inputs) {
        Ok(plan) => plan,
        Err(e) => return VerbOutcome::validation(e),
    };
    for task in &mut plan.tasks {
        task.timeout_ms = Some(timeout_ms);
    }

    let records = vec![
        OutputRecord::new("timeout", json!(timeout_ms)),
        OutputRecord::plan("plan", plan_value(&plan)),
    ];
    VerbOutcome::expand(plan, records, step.scope_id)
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// `WHILE` checks the condition before every iteration; `UNTIL` runs the body
/// once before the first check. Each iteration re-emits the loop step as a
/// continuation gated on the body, carrying the raw (unresolved) inputs so
/// placeholders and embedded references re-resolve against fresh data.
fn while_loop(
    step: &Step,
    inputs: &HashMap<String, Value>,
    config: &AgentConfig,
    check_after_body: bool,
) -> VerbOutcome {
    let iteration = inputs
        .get(ITERATION_INPUT)
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    if iteration >= config.loop_body_safety_cap {
        return VerbOutcome::permanent(format!(
            "loop safety cap of {} iterations exceeded",
            config.loop_body_safety_cap
        ));
    }

    let condition = inputs.get("condition").cloned().unwrap_or(Value::Null);
    let condition_met = is_truthy(&condition);

    // Termination: WHILE stops when the condition is false; UNTIL stops when
    // it has become true, but only after at least one body run.
    let stop = if check_after_body {
        iteration > 0 && condition_met
    } else {
        !condition_met
    };
    if stop {
        return VerbOutcome::complete(vec![
            OutputRecord::new("iterations", json!(iteration)),
            OutputRecord::new("condition_result", json!(condition_met)),
        ]);
    }

    let body = match required_plan(inputs) {
        Ok(plan) => plan,
        Err(e) => return VerbOutcome::validation(e),
    };
    if body.is_empty() {
        return VerbOutcome::validation("loop body must contain at least one step");
    }

    let mut tasks = instantiate(&body, iteration as usize, &HashMap::new());
    let body_len = tasks.len();

    // Continuation: the loop verb again, gated on every body task.
    let mut continuation = PlanTask::new(step.verb.clone())
        .with_description(step.description.clone())
        .with_input(ITERATION_INPUT, TaskInput::literal(json!(iteration + 1)));
    for (name, source) in &step.input_refs {
        if name == ITERATION_INPUT {
            continue;
        }
        continuation = continuation.with_input(name.clone(), raw_task_input(source));
    }
    for idx in 1..=body_len {
        continuation.dependencies.push(troupe_kernel::plan::TaskDependency {
            task: TaskRef::Ordinal(idx),
            output: "completed".into(),
            input: format!("__body_{idx}"),
        });
    }
    tasks.push(continuation);

    let plan = PlanDescription::new(tasks);
    let records = vec![
        OutputRecord::new("iteration", json!(iteration)),
        OutputRecord::plan("plan", plan_value(&plan)),
    ];
    VerbOutcome::expand(plan, records, step.scope_id)
}

// ---------------------------------------------------------------------------
// FOREACH
// ---------------------------------------------------------------------------

fn foreach(step: &Step, inputs: &HashMap<String, Value>, config: &AgentConfig) -> VerbOutcome {
    let Some(Value::Array(items)) = inputs.get("array") else {
        return VerbOutcome::validation("FOREACH requires an 'array' input");
    };

    // Empty input: zero sub-steps, immediately completed.
    if items.is_empty() {
        return VerbOutcome::complete(vec![
            OutputRecord::new("execution_status", json!("completed")),
            OutputRecord::new("item_count", json!(0)),
        ]);
    }

    let template = match required_plan(inputs) {
        Ok(plan) => plan,
        Err(e) => return VerbOutcome::validation(e),
    };

    let start = step.current_index.min(items.len());
    // An explicit batch size is honored as-is; only the missing/invalid
    // case falls back to the whole remaining slice, capped for safety.
    let batch_size = inputs
        .get("batch_size")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or_else(|| config.foreach_default_batch_cap.max(1));
    let end = (start + batch_size).min(items.len());

    let mut tasks = Vec::with_capacity((end - start) * template.len());
    for (offset, item) in items[start..end].iter().enumerate() {
        let index = start + offset;
        let mut injected = HashMap::new();
        injected.insert("item".to_string(), item.clone());
        injected.insert("index".to_string(), json!(index));
        tasks.extend(instantiate(&template, index, &injected));
    }
    let plan = PlanDescription::new(tasks);
    let done = end >= items.len();

    debug!(
        step = %step.id,
        batch = end - start,
        next_index = end,
        done,
        "foreach batch expanded"
    );

    if done {
        VerbOutcome::Expand {
            records: vec![
                OutputRecord::new("execution_status", json!("completed")),
                OutputRecord::new("item_count", json!(items.len())),
                OutputRecord::plan("plan", plan_value(&plan)),
            ],
            plan,
            scope: Some(step.id),
        }
    } else {
        VerbOutcome::InProgress {
            plan,
            next_index: end,
        }
    }
}

// ---------------------------------------------------------------------------
// REGROUP
// ---------------------------------------------------------------------------

fn regroup(step: &Step, inputs: &HashMap<String, Value>, steps: &[Step]) -> VerbOutcome {
    let member_ids: Vec<Uuid> = match inputs.get("stepIdsToRegroup") {
        Some(Value::Array(ids)) => {
            let mut parsed = Vec::with_capacity(ids.len());
            for id in ids {
                match id.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    Some(id) => parsed.push(id),
                    None => {
                        return VerbOutcome::validation(format!(
                            "stepIdsToRegroup contains a non-id entry: {id}"
                        ));
                    }
                }
            }
            parsed
        }
        // Aggregating a whole iteration scope is the common case.
        None => match inputs.get("scope_id").and_then(|v| v.as_str()) {
            Some(scope) => match Uuid::parse_str(scope) {
                Ok(scope) => steps
                    .iter()
                    .filter(|s| s.scope_id == Some(scope))
                    .map(|s| s.id)
                    .collect(),
                Err(_) => return VerbOutcome::validation("scope_id is not a valid id"),
            },
            None => {
                return VerbOutcome::validation(
                    "REGROUP requires 'stepIdsToRegroup' or 'scope_id'",
                );
            }
        },
        Some(other) => {
            return VerbOutcome::validation(format!(
                "stepIdsToRegroup must be an array, got {other}"
            ));
        }
    };

    if member_ids.is_empty() {
        return VerbOutcome::complete(vec![OutputRecord::new("regrouped_results", json!([]))]);
    }

    let mut results = Vec::new();
    for id in &member_ids {
        let Some(member) = steps.iter().find(|s| s.id == *id) else {
            return VerbOutcome::permanent(format!("regroup member {id} is unknown"));
        };
        match member.status {
            StepStatus::Error | StepStatus::Cancelled => {
                return VerbOutcome::permanent(format!(
                    "regroup member {id} ended in {}",
                    member.status
                ));
            }
            status if status.is_terminal() => {
                for record in &member.result {
                    results.push(json!({
                        "step_id": id.to_string(),
                        "name": record.name,
                        "result": record.result,
                    }));
                }
            }
            _ => return VerbOutcome::Defer,
        }
    }

    VerbOutcome::complete(vec![OutputRecord::new("regrouped_results", Value::Array(results))])
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Truthiness of a condition value: booleans as-is, numbers by non-zero,
/// strings by content ("false" and empty are false), containers by
/// non-emptiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}

fn parse_plan(value: &Value) -> Result<PlanDescription, String> {
    let plan = PlanDescription::from_value(value)
        .map_err(|e| format!("invalid sub-plan: {e}"))?;
    plan.validate().map_err(|e| format!("invalid sub-plan: {e}"))?;
    Ok(plan)
}

fn required_plan(inputs: &HashMap<String, Value>) -> Result<PlanDescription, String> {
    match inputs.get("steps") {
        Some(tasks) => parse_plan(tasks),
        None => Err("missing required input 'steps'".into()),
    }
}

fn plan_value(plan: &PlanDescription) -> Value {
    serde_json::to_value(plan).unwrap_or(json!([]))
}

/// Instantiate a sub-plan template for one copy/iteration.
///
/// Task ids are mangled with the copy index to keep them unique across
/// instantiations, intra-template id references are rewritten to match, and
/// parent-scope `item`/`index` references are replaced by the injected
/// literals.
fn instantiate(
    template: &PlanDescription,
    copy: usize,
    injected: &HashMap<String, Value>,
) -> Vec<PlanTask> {
    let mangle = |id: &str| format!("{id}__{copy}");

    template
        .tasks
        .iter()
        .map(|task| {
            let mut out = task.clone();
            if let Some(id) = &task.id {
                out.id = Some(mangle(id));
            }
            for input in out.inputs.values_mut() {
                rewrite_input(input, &mangle, injected);
            }
            for dep in &mut out.dependencies {
                rewrite_ref(&mut dep.task, &mangle, template);
            }
            out
        })
        .collect()
}

fn rewrite_input(
    input: &mut TaskInput,
    mangle: &impl Fn(&str) -> String,
    injected: &HashMap<String, Value>,
) {
    if let TaskInput::Output { task, output } = input {
        if task.is_parent()
            && let Some(value) = injected.get(output.as_str())
        {
            *input = TaskInput::Literal(value.clone());
            return;
        }
        // External UUID references (prior iterations) stay as-is.
        if let TaskRef::Id(id) = task
            && Uuid::parse_str(id).is_err()
        {
            *task = TaskRef::Id(mangle(id));
        }
    }
}

fn rewrite_ref(
    task_ref: &mut TaskRef,
    mangle: &impl Fn(&str) -> String,
    template: &PlanDescription,
) {
    if let TaskRef::Id(id) = task_ref
        && Uuid::parse_str(id).is_err()
        && template.task_by_id(id).is_some()
    {
        *task_ref = TaskRef::Id(mangle(id));
    }
}

// ---------------------------------------------------------------------------
// Continuation input rebuilding
// ---------------------------------------------------------------------------

/// Carry a step's raw input reference into a continuation task so it
/// re-resolves on the next iteration instead of freezing the current value.
fn raw_task_input(source: &InputSource) -> TaskInput {
    match source {
        InputSource::Literal(value) => TaskInput::Literal(value.clone()),
        InputSource::Output {
            source_step,
            output_name,
        } => match source_step.step_id() {
            Some(id) => TaskInput::output(TaskRef::Id(id.to_string()), output_name.clone()),
            None => TaskInput::parent_output(output_name.clone()),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
