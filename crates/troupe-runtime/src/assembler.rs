//! Plan assembly.
//!
//! Turns a validated plan description into wired [`Step`]s: fresh
//! identifiers, ordinal and id dependencies translated into step-id edges,
//! parent-scope references short-circuited where the parent already resolved
//! the value, and out-of-plan sources flagged as potential cross-agent
//! dependencies.

use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use troupe_kernel::error::{KernelError, KernelResult};
use troupe_kernel::plan::{PlanDescription, PlanTask, TaskInput, TaskRef};
use troupe_kernel::step::{Dependency, InputSource, Step, StepRef};

/// Context of one assembly: who owns the new steps, and which expansion (if
/// any) produced them.
pub struct AssemblyContext<'a> {
    pub mission_id: Uuid,
    pub owner: Uuid,
    /// The control-flow or planner step being expanded.
    pub parent: Option<&'a Step>,
    /// Scope stamped onto every emitted step (a `FOREACH` instance id).
    pub scope_id: Option<Uuid>,
    /// The owning agent's current step list, used to flag unknown sources.
    pub known_steps: &'a [Step],
}

impl<'a> AssemblyContext<'a> {
    pub fn root(mission_id: Uuid, owner: Uuid) -> Self {
        Self {
            mission_id,
            owner,
            parent: None,
            scope_id: None,
            known_steps: &[],
        }
    }

    pub fn expansion(parent: &'a Step, scope_id: Option<Uuid>, known_steps: &'a [Step]) -> Self {
        Self {
            mission_id: parent.mission_id,
            owner: parent.current_owner,
            parent: Some(parent),
            scope_id: scope_id.or(parent.scope_id),
            known_steps,
        }
    }
}

/// Instantiate steps from a plan description.
///
/// Fails fast on invalid plans and on parent-scope references without a
/// parent. Dependencies on steps outside the plan (and outside the known
/// step list) are flagged, not failed: they may resolve cross-agent.
pub fn assemble(plan: &PlanDescription, ctx: &AssemblyContext<'_>) -> KernelResult<Vec<Step>> {
    plan.validate()?;

    // First pass: a fresh identifier per task, addressable by ordinal and by
    // task-supplied id.
    let ids: Vec<Uuid> = plan.tasks.iter().map(|_| Uuid::new_v4()).collect();
    let mut by_task_id: HashMap<&str, Uuid> = HashMap::new();
    for (task, id) in plan.tasks.iter().zip(&ids) {
        if let Some(task_id) = task.id.as_deref() {
            by_task_id.insert(task_id, *id);
        }
    }

    let mut steps = Vec::with_capacity(plan.tasks.len());
    for (ordinal, task) in plan.tasks.iter().enumerate() {
        let mut step = Step::new(ctx.mission_id, ctx.owner, task.verb.clone())
            .with_description(task.description.clone());
        step.id = ids[ordinal];
        step.parent_id = ctx.parent.map(|p| p.id);
        step.scope_id = ctx.scope_id;
        step.recommended_role = task.recommended_role.clone();
        step.timeout_ms = task.timeout_ms;

        for (name, input) in &task.inputs {
            wire_input(&mut step, name, input, plan, &ids, &by_task_id, ctx)?;
        }
        for dep in &task.dependencies {
            let source = translate_ref(&dep.task, plan, &ids, &by_task_id, ctx)?;
            step.dependencies
                .push(Dependency::new(source, dep.output.clone(), dep.input.clone()));
        }
        for (name, description) in &task.outputs {
            step.outputs.insert(name.clone(), description.clone());
        }

        steps.push(step);
    }

    // Second pass: flag dependencies whose source lives outside this plan
    // and outside the known step list. They are treated as potential
    // cross-agent dependencies and left for the resolver.
    let plan_ids: std::collections::HashSet<Uuid> = ids.iter().copied().collect();
    for step in &steps {
        for dep in &step.dependencies {
            if let StepRef::Step(source) = dep.source_step
                && !plan_ids.contains(&source)
                && !ctx.known_steps.iter().any(|s| s.id == source)
            {
                debug!(
                    step = %step.id,
                    source = %source,
                    input = %dep.input_name,
                    "dependency source outside plan; treating as potential cross-agent reference"
                );
            }
        }
    }

    Ok(steps)
}

/// Wire one declared task input onto the assembled step.
fn wire_input(
    step: &mut Step,
    name: &str,
    input: &TaskInput,
    plan: &PlanDescription,
    ids: &[Uuid],
    by_task_id: &HashMap<&str, Uuid>,
    ctx: &AssemblyContext<'_>,
) -> KernelResult<()> {
    match input {
        TaskInput::Literal(value) => {
            step.input_refs
                .insert(name.to_string(), InputSource::Literal(value.clone()));
        }
        TaskInput::Output { task, output } if task.is_parent() => {
            let Some(parent) = ctx.parent else {
                return Err(KernelError::InvalidPlan(format!(
                    "input '{name}' references the parent scope, but the plan has no parent"
                )));
            };
            if let Some(resolved) = parent.input_values.get(output) {
                // Short-circuit: copy the parent's resolved value directly.
                step.input_refs
                    .insert(name.to_string(), InputSource::Literal(resolved.clone()));
            } else if let Some(upstream) = parent
                .dependencies
                .iter()
                .find(|d| d.input_name == *output && !d.is_signal())
            {
                // The parent has not resolved it yet; point the child at
                // whatever the parent depends on for that name.
                step.input_refs.insert(
                    name.to_string(),
                    InputSource::output(upstream.source_step, upstream.output_name.clone()),
                );
                step.dependencies.push(Dependency::new(
                    upstream.source_step,
                    upstream.output_name.clone(),
                    name.to_string(),
                ));
            } else {
                step.input_refs.insert(
                    name.to_string(),
                    InputSource::output(StepRef::Parent, output.clone()),
                );
                step.dependencies.push(Dependency::new(
                    StepRef::Parent,
                    output.clone(),
                    name.to_string(),
                ));
            }
        }
        TaskInput::Output { task, output } => {
            let source = translate_ref(task, plan, ids, by_task_id, ctx)?;
            step.input_refs.insert(
                name.to_string(),
                InputSource::output(source, output.clone()),
            );
            step.dependencies
                .push(Dependency::new(source, output.clone(), name.to_string()));
        }
    }
    Ok(())
}

/// Translate a plan-level task reference into a step reference.
fn translate_ref(
    task_ref: &TaskRef,
    plan: &PlanDescription,
    ids: &[Uuid],
    by_task_id: &HashMap<&str, Uuid>,
    ctx: &AssemblyContext<'_>,
) -> KernelResult<StepRef> {
    if task_ref.is_parent() {
        if ctx.parent.is_none() {
            return Err(KernelError::InvalidPlan(
                "parent-scope dependency without a parent".into(),
            ));
        }
        return Ok(StepRef::Parent);
    }
    match task_ref {
        TaskRef::Ordinal(n) => match plan.resolve_ref(task_ref) {
            Some(idx) => Ok(StepRef::Step(ids[idx])),
            None => Err(KernelError::InvalidPlan(format!(
                "ordinal dependency {n} is out of range"
            ))),
        },
        TaskRef::Id(id) => {
            if let Some(step_id) = by_task_id.get(id.as_str()) {
                Ok(StepRef::Step(*step_id))
            } else if let Some(external) = task_ref.external_id() {
                Ok(StepRef::Step(external))
            } else {
                Err(KernelError::InvalidPlan(format!(
                    "dependency references unknown task '{id}'"
                )))
            }
        }
    }
}

/// Describe assembled steps back as a plan, using step ids as task ids.
///
/// `assemble` of the result reproduces the same dependency edges, which is
/// what snapshot tooling and reflection prompts rely on.
pub fn describe(steps: &[Step]) -> PlanDescription {
    let tasks = steps
        .iter()
        .map(|step| {
            let mut task = PlanTask::new(step.verb.clone())
                .with_id(step.id.to_string())
                .with_description(step.description.clone());
            for (name, source) in &step.input_refs {
                let input = match source {
                    InputSource::Literal(value) => TaskInput::Literal(value.clone()),
                    InputSource::Output {
                        source_step,
                        output_name,
                    } => match source_step.step_id() {
                        Some(id) => {
                            TaskInput::output(TaskRef::Id(id.to_string()), output_name.clone())
                        }
                        None => TaskInput::parent_output(output_name.clone()),
                    },
                };
                task = task.with_input(name.clone(), input);
            }
            for dep in &step.dependencies {
                // Data edges are already described through inputs.
                if dep.is_signal() {
                    let source = match dep.source_step.step_id() {
                        Some(id) => TaskRef::Id(id.to_string()),
                        None => TaskRef::Ordinal(0),
                    };
                    task = task.with_dependency(source, dep.output_name.clone(), dep.input_name.clone());
                }
            }
            for (name, description) in &step.outputs {
                task = task.with_output(name.clone(), description.clone());
            }
            if let Some(role) = &step.recommended_role {
                task = task.with_recommended_role(role.clone());
            }
            task.timeout_ms = step.timeout_ms;
            task
        })
        .collect();
    PlanDescription::new(tasks)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
