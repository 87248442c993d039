//! Input resolution.
//!
//! Hydrates a step's runtime inputs from literals, dependency outputs,
//! cross-agent lookups, and `{name}` placeholders. The resolver never fails a
//! step directly: a required input that cannot be resolved is recorded under a
//! reserved `__failed_<name>` marker and the scheduler decides whether to
//! defer, replan, or surface.
//!
//! Resolution is idempotent: running it twice against an unchanged step list
//! yields the same map.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;
use uuid::Uuid;

use troupe_kernel::services::DynPersistenceService;
use troupe_kernel::step::{
    FAILED_INPUT_PREFIX, InputSource, Step, StepRef, StepStatus,
};

use crate::remote::CrossAgentResolver;

/// Where the resolver may look for dependency outputs, in priority order:
/// the local step list, the cross-agent resolver, then persistence.
pub struct ResolutionSources<'a> {
    pub steps: &'a [Step],
    pub cross_agent: Option<&'a CrossAgentResolver>,
    pub persistence: Option<&'a DynPersistenceService>,
}

impl<'a> ResolutionSources<'a> {
    pub fn local(steps: &'a [Step]) -> Self {
        Self {
            steps,
            cross_agent: None,
            persistence: None,
        }
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Produce the complete runtime input map for a step.
pub async fn resolve_inputs(
    step: &Step,
    mission_id: Uuid,
    sources: &ResolutionSources<'_>,
) -> HashMap<String, Value> {
    let mut resolved: HashMap<String, Value> = HashMap::new();

    // Phase 0 — seed: pre-injected values (e.g. a FOREACH iteration item)
    // and the mission identifier.
    for (name, value) in &step.input_values {
        resolved.insert(name.clone(), value.clone());
    }
    resolved.insert("missionId".into(), Value::String(mission_id.to_string()));

    // Phase 1 — literals.
    for (name, source) in &step.input_refs {
        if let InputSource::Literal(value) = source {
            resolved.insert(name.clone(), value.clone());
        }
    }

    // Phase 2 — dependency hydration.
    for dep in &step.dependencies {
        if dep.is_signal() {
            continue;
        }
        match hydrate_output(&dep.source_step, &dep.output_name, step, sources).await {
            Some(value) => {
                let value = coerce_for_input(&dep.input_name, value);
                let value = resolve_embedded_refs(value, &resolved, sources);
                resolved.insert(dep.input_name.clone(), value);
            }
            None => {
                resolved.insert(
                    format!("{FAILED_INPUT_PREFIX}{}", dep.input_name),
                    Value::String(format!(
                        "unresolved dependency: {} of {:?}",
                        dep.output_name, dep.source_step
                    )),
                );
            }
        }
    }

    // Input references not backed by an explicit dependency edge still
    // resolve the same way.
    for (name, source) in &step.input_refs {
        if resolved.contains_key(name) {
            continue;
        }
        if let InputSource::Output {
            source_step,
            output_name,
        } = source
        {
            match hydrate_output(source_step, output_name, step, sources).await {
                Some(value) => {
                    let value = coerce_for_input(name, value);
                    let value = resolve_embedded_refs(value, &resolved, sources);
                    resolved.insert(name.clone(), value);
                }
                None => {
                    resolved.insert(
                        format!("{FAILED_INPUT_PREFIX}{name}"),
                        Value::String(format!(
                            "unresolved reference: {output_name} of {source_step:?}"
                        )),
                    );
                }
            }
        }
    }

    // Phase 3 — embedded reference resolution over the whole map.
    let snapshot = resolved.clone();
    for value in resolved.values_mut() {
        *value = resolve_embedded_refs(std::mem::take(value), &snapshot, sources);
    }

    // Phase 4 — placeholder substitution from the most recent completed
    // step outputs. Unresolvable placeholders stay untouched.
    for value in resolved.values_mut() {
        *value = substitute_placeholders(std::mem::take(value), sources.steps);
    }

    resolved
}

/// Names of inputs the resolver failed to hydrate.
pub fn failed_inputs(values: &HashMap<String, Value>) -> Vec<String> {
    values
        .keys()
        .filter_map(|k| k.strip_prefix(FAILED_INPUT_PREFIX))
        .map(|s| s.to_string())
        .collect()
}

/// `{name}` placeholders declared in a step's raw input template (literal
/// references and pre-injected values), before any resolution.
pub fn template_placeholders(step: &Step) -> Vec<String> {
    let mut names = Vec::new();
    for source in step.input_refs.values() {
        if let InputSource::Literal(value) = source {
            collect_placeholders(value, &mut names);
        }
    }
    for value in step.input_values.values() {
        collect_placeholders(value, &mut names);
    }
    names.sort();
    names.dedup();
    names
}

/// `{name}` placeholders remaining in any string value of the map.
pub fn unresolved_placeholders(values: &HashMap<String, Value>) -> Vec<String> {
    let mut names = Vec::new();
    for value in values.values() {
        collect_placeholders(value, &mut names);
    }
    names.sort();
    names.dedup();
    names
}

fn collect_placeholders(value: &Value, into: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for capture in placeholder_pattern().captures_iter(s) {
                into.push(capture[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, into)),
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, into)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Phase 2 internals
// ---------------------------------------------------------------------------

async fn hydrate_output(
    source: &StepRef,
    output_name: &str,
    step: &Step,
    sources: &ResolutionSources<'_>,
) -> Option<Value> {
    match source {
        // Parent-scope lookup: the expanding step's already-resolved inputs.
        StepRef::Parent => {
            let parent_id = step.parent_id?;
            let parent = sources.steps.iter().find(|s| s.id == parent_id)?;
            parent.input_values.get(output_name).cloned()
        }
        StepRef::Step(id) => {
            if let Some(local) = sources.steps.iter().find(|s| s.id == *id) {
                if let Some(record) = local.output(output_name) {
                    if !record.result.is_null() {
                        return Some(reparse_stringly(record.result.clone(), record));
                    }
                    // Pruned in memory; fall through to the work-product.
                }
                if local.status == StepStatus::Completed
                    && let Some(value) = load_from_work_product(*id, output_name, sources).await
                {
                    return Some(value);
                }
                return local
                    .output(output_name)
                    .map(|r| reparse_stringly(r.result.clone(), r));
            }

            // Not local: registry lookup, then persistence.
            if let Some(cross) = sources.cross_agent
                && let Ok(Some(view)) = cross.resolve(*id).await
                && let Some(record) = view.result.iter().find(|r| r.name == output_name)
            {
                return Some(reparse_stringly(record.result.clone(), record));
            }
            if let Some(persistence) = sources.persistence {
                if let Ok(Some(found)) = persistence.load_step(*id).await
                    && let Some(record) = found.output(output_name)
                {
                    return Some(reparse_stringly(record.result.clone(), record));
                }
                if let Some(value) = load_from_work_product(*id, output_name, sources).await {
                    return Some(value);
                }
            }
            None
        }
    }
}

async fn load_from_work_product(
    step_id: Uuid,
    output_name: &str,
    sources: &ResolutionSources<'_>,
) -> Option<Value> {
    let persistence = sources.persistence?;
    let wp = persistence.load_work_product(step_id).await.ok()??;
    wp.outputs
        .iter()
        .find(|r| r.name == output_name)
        .map(|r| reparse_stringly(r.result.clone(), r))
}

/// A declared object/array output hydrated as a string is reparsed as
/// structured data, falling back to the raw string.
fn reparse_stringly(value: Value, record: &troupe_kernel::step::OutputRecord) -> Value {
    use troupe_kernel::step::ResultType;
    if let Value::String(s) = &value
        && matches!(record.result_type, ResultType::Object | ResultType::Array)
        && let Ok(parsed) = serde_json::from_str::<Value>(s)
        && (parsed.is_object() || parsed.is_array())
    {
        return parsed;
    }
    value
}

/// Object values carrying a property named like the consuming input collapse
/// to that property (a producing step commonly wraps its answer in an object
/// keyed by the output name).
fn coerce_for_input(input_name: &str, value: Value) -> Value {
    if let Value::Object(map) = &value
        && let Some(inner) = map.get(input_name)
    {
        return inner.clone();
    }
    value
}

// ---------------------------------------------------------------------------
// Phase 3 internals
// ---------------------------------------------------------------------------

/// Walk arrays and objects, replacing every embedded reference object of
/// shape `{sourceStep, outputName}`. A `sourceStep` of `0` looks the name up
/// in the current step's already-resolved input map.
fn resolve_embedded_refs(
    value: Value,
    resolved: &HashMap<String, Value>,
    sources: &ResolutionSources<'_>,
) -> Value {
    match value {
        Value::Object(map) => {
            if let Some((source, output_name)) = as_embedded_ref(&map) {
                let replacement = match source {
                    StepRef::Parent => resolved.get(&output_name).cloned(),
                    StepRef::Step(id) => sources
                        .steps
                        .iter()
                        .find(|s| s.id == id)
                        .and_then(|s| s.output(&output_name))
                        .map(|r| r.result.clone()),
                };
                match replacement {
                    Some(v) => v,
                    // Leave the reference object in place when it cannot be
                    // resolved yet; a later pass may succeed.
                    None => Value::Object(map),
                }
            } else {
                Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, resolve_embedded_refs(v, resolved, sources)))
                        .collect(),
                )
            }
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_embedded_refs(v, resolved, sources))
                .collect(),
        ),
        other => other,
    }
}

fn as_embedded_ref(map: &Map<String, Value>) -> Option<(StepRef, String)> {
    if map.len() != 2 {
        return None;
    }
    let source = map.get("sourceStep").or_else(|| map.get("source_step"))?;
    let output = map
        .get("outputName")
        .or_else(|| map.get("output_name"))?
        .as_str()?;

    let source = match source {
        Value::Number(n) if n.as_u64() == Some(0) => StepRef::Parent,
        Value::String(s) => StepRef::Step(Uuid::parse_str(s).ok()?),
        _ => return None,
    };
    Some((source, output.to_string()))
}

// ---------------------------------------------------------------------------
// Phase 4 internals
// ---------------------------------------------------------------------------

fn substitute_placeholders(value: Value, steps: &[Step]) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_in_string(&s, steps)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute_placeholders(v, steps))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_placeholders(v, steps)))
                .collect(),
        ),
        other => other,
    }
}

fn substitute_in_string(input: &str, steps: &[Step]) -> String {
    placeholder_pattern()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match latest_completed_output(steps, name) {
                Some(value) => value_to_text(&value),
                None => {
                    debug!(placeholder = name, "placeholder left unresolved");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// The named output of the most recently updated completed step.
fn latest_completed_output(steps: &[Step], name: &str) -> Option<Value> {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .filter_map(|s| s.output(name).map(|r| (s.updated_at, r.result.clone())))
        .max_by_key(|(updated, _)| *updated)
        .map(|(_, value)| value)
}

/// Stable textual form: strings verbatim, everything else compact JSON.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use troupe_kernel::step::{Dependency, OutputRecord, ResultType};

    fn completed(mission: Uuid, owner: Uuid, verb: &str, outputs: Vec<OutputRecord>) -> Step {
        let mut step = Step::new(mission, owner, verb);
        step.transition(StepStatus::Running).unwrap();
        step.complete(outputs).unwrap();
        step
    }

    #[tokio::test]
    async fn literals_and_mission_id_are_seeded() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let step = Step::new(mission, owner, "CALL")
            .with_input("count", InputSource::literal(json!(5)));

        let values = resolve_inputs(&step, mission, &ResolutionSources::local(&[])).await;
        assert_eq!(values["count"], json!(5));
        assert_eq!(values["missionId"], json!(mission.to_string()));
    }

    #[tokio::test]
    async fn dependency_output_is_hydrated() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let producer = completed(
            mission,
            owner,
            "THINK",
            vec![OutputRecord::new("answer", json!("42"))],
        );
        let consumer = Step::new(mission, owner, "RETURN")
            .with_dependency(Dependency::new(StepRef::Step(producer.id), "answer", "answer"));

        let steps = vec![producer];
        let values =
            resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        assert_eq!(values["answer"], json!("42"));
        assert!(failed_inputs(&values).is_empty());
    }

    #[tokio::test]
    async fn missing_dependency_records_failed_marker() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let consumer = Step::new(mission, owner, "RETURN").with_dependency(Dependency::new(
            StepRef::Step(Uuid::new_v4()),
            "answer",
            "answer",
        ));

        let values = resolve_inputs(&consumer, mission, &ResolutionSources::local(&[])).await;
        assert!(!values.contains_key("answer"));
        assert_eq!(failed_inputs(&values), vec!["answer".to_string()]);
    }

    #[tokio::test]
    async fn stringly_structured_outputs_are_reparsed() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let mut record = OutputRecord::new("items", json!(r#"[1, 2, 3]"#));
        record.result_type = ResultType::Array;
        let producer = completed(mission, owner, "CALL", vec![record]);
        let consumer = Step::new(mission, owner, "FOREACH")
            .with_dependency(Dependency::new(StepRef::Step(producer.id), "items", "array"));

        let steps = vec![producer];
        let values =
            resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        assert_eq!(values["array"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn object_collapses_to_matching_property() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let producer = completed(
            mission,
            owner,
            "CALL",
            vec![OutputRecord::new("data", json!({"summary": "short", "extra": 1}))],
        );
        let consumer = Step::new(mission, owner, "RETURN")
            .with_dependency(Dependency::new(StepRef::Step(producer.id), "data", "summary"));

        let steps = vec![producer];
        let values =
            resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        assert_eq!(values["summary"], json!("short"));
    }

    #[tokio::test]
    async fn embedded_references_are_replaced_recursively() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let producer = completed(
            mission,
            owner,
            "THINK",
            vec![OutputRecord::new("answer", json!("resolved"))],
        );
        let consumer = Step::new(mission, owner, "CALL").with_input(
            "payload",
            InputSource::literal(json!({
                "nested": [
                    {"sourceStep": producer.id.to_string(), "outputName": "answer"}
                ]
            })),
        );

        let steps = vec![producer];
        let values =
            resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        assert_eq!(values["payload"]["nested"][0], json!("resolved"));
    }

    #[tokio::test]
    async fn embedded_parent_reference_reads_resolved_map() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let mut consumer = Step::new(mission, owner, "ECHO").with_input(
            "wrapped",
            InputSource::literal(json!({"sourceStep": 0, "outputName": "item"})),
        );
        // Pre-injected by the FOREACH parent.
        consumer.input_values.insert("item".into(), json!(7));

        let values = resolve_inputs(&consumer, mission, &ResolutionSources::local(&[])).await;
        assert_eq!(values["wrapped"], json!(7));
    }

    #[tokio::test]
    async fn placeholders_substitute_from_latest_completed_step() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let mut older = completed(
            mission,
            owner,
            "THINK",
            vec![OutputRecord::new("topic", json!("old"))],
        );
        older.updated_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        let newer = completed(
            mission,
            owner,
            "THINK",
            vec![OutputRecord::new("topic", json!("fresh"))],
        );

        let consumer = Step::new(mission, owner, "CALL")
            .with_input("prompt", InputSource::literal(json!("write about {topic}")));

        let steps = vec![older, newer];
        let values =
            resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        assert_eq!(values["prompt"], json!("write about fresh"));
    }

    #[tokio::test]
    async fn unknown_placeholder_is_left_untouched() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let consumer = Step::new(mission, owner, "CALL")
            .with_input("prompt", InputSource::literal(json!("hello {nobody}")));

        let values = resolve_inputs(&consumer, mission, &ResolutionSources::local(&[])).await;
        assert_eq!(values["prompt"], json!("hello {nobody}"));
        assert_eq!(unresolved_placeholders(&values), vec!["nobody".to_string()]);
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let producer = completed(
            mission,
            owner,
            "THINK",
            vec![OutputRecord::new("answer", json!({"answer": "inner"}))],
        );
        let consumer = Step::new(mission, owner, "RETURN")
            .with_input("prompt", InputSource::literal(json!("use {answer}")))
            .with_dependency(Dependency::new(StepRef::Step(producer.id), "answer", "answer"));

        let steps = vec![producer];
        let first = resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        let second = resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn signal_dependencies_resolve_no_value() {
        let mission = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let producer = completed(
            mission,
            owner,
            "CALL",
            vec![OutputRecord::new("done", json!(true))],
        );
        let consumer = Step::new(mission, owner, "CALL")
            .with_dependency(Dependency::new(StepRef::Step(producer.id), "done", "__after"));

        let steps = vec![producer];
        let values =
            resolve_inputs(&consumer, mission, &ResolutionSources::local(&steps)).await;
        assert!(!values.contains_key("__after"));
        assert!(failed_inputs(&values).is_empty());
    }
}
