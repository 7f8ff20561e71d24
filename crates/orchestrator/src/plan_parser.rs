//! Turning a planner response into a [`Plan`].
//!
//! Extraction is tolerant of prose around the payload, decoding is strict:
//! a fenced block that is not valid JSON fails the whole response, and a
//! plan with one bad step is rejected as a whole.

use serde_json::{Map, Value};
use taskflow_core::{Plan, Step, WorkerKey};

use crate::error::PlanParseFailure;
use crate::json_extract::{balanced_objects, fenced_json_blocks};
use crate::workers::WorkerRegistry;

/// Marker a planner answers with when the current plan needs no change.
pub const NO_UPDATE: &str = "NO_UPDATE";

/// Parse a planner response.
///
/// Returns `Ok(None)` when the planner answered [`NO_UPDATE`].
pub fn parse_plan_response(
    text: &str,
    goal: &str,
    registry: &WorkerRegistry,
) -> Result<Option<Plan>, PlanParseFailure> {
    if text.contains(NO_UPDATE) {
        return Ok(None);
    }

    let payload = locate_plan_object(text)?;
    let plan_value = payload.get("plan").ok_or(PlanParseFailure::MissingPlan)?;
    let steps = parse_steps(plan_value, registry)?;
    Ok(Some(Plan::new(goal, steps)))
}

fn locate_plan_object(text: &str) -> Result<Map<String, Value>, PlanParseFailure> {
    let blocks = fenced_json_blocks(text);
    if !blocks.is_empty() {
        for block in blocks {
            match serde_json::from_str::<Value>(block) {
                Ok(Value::Object(map)) if map.contains_key("plan") => return Ok(map),
                Ok(_) => continue,
                Err(e) => return Err(PlanParseFailure::malformed(e, block)),
            }
        }
        return Err(PlanParseFailure::MissingPlan);
    }

    let candidates = balanced_objects(text);
    let Some(first) = candidates.first() else {
        return Err(PlanParseFailure::NoJsonFound);
    };

    let mut first_error = None;
    let mut any_object = false;
    for candidate in &candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) if map.contains_key("plan") => return Ok(map),
            Ok(_) => any_object = true,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if !any_object => Err(PlanParseFailure::malformed(e, first)),
        _ => Err(PlanParseFailure::MissingPlan),
    }
}

fn parse_steps(value: &Value, registry: &WorkerRegistry) -> Result<Vec<Step>, PlanParseFailure> {
    let items = value.as_array().ok_or(PlanParseFailure::MissingPlan)?;
    if items.is_empty() {
        return Err(PlanParseFailure::EmptyPlan);
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_step(index, item, registry))
        .collect()
}

fn parse_step(index: usize, item: &Value, registry: &WorkerRegistry) -> Result<Step, PlanParseFailure> {
    let missing = |field: &str| PlanParseFailure::MissingField {
        index,
        field: field.to_string(),
    };

    let obj = item.as_object().ok_or_else(|| missing("id"))?;

    let id = obj.get("id").and_then(scalar_text).ok_or_else(|| missing("id"))?;
    let task = obj
        .get("task")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| missing("task"))?;
    let raw_worker = obj
        .get("worker")
        .or_else(|| obj.get("agent"))
        .and_then(Value::as_str)
        .ok_or_else(|| missing("agent"))?;

    let worker = WorkerKey::resolve(raw_worker)
        .filter(|key| registry.contains(*key))
        .ok_or_else(|| PlanParseFailure::UnknownWorker {
            index,
            worker: raw_worker.to_string(),
        })?;

    let deliverable = obj
        .get("deliverable")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let checks = obj
        .get("definition_of_done")
        .or_else(|| obj.get("dod"))
        .map(text_list)
        .unwrap_or_default();
    let needs = obj
        .get("need")
        .or_else(|| obj.get("needs"))
        .map(text_list)
        .unwrap_or_default();

    Ok(Step::new(id, worker, task)
        .with_deliverable(deliverable)
        .with_definition_of_done(checks)
        .with_needs(needs))
}

/// Strings and numbers as text; anything else is absent.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A list of scalars, or a single scalar treated as a one-item list.
fn text_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(other).into_iter().collect(),
    }
}
