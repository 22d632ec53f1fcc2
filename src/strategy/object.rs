//! Structured-object and object-array generation.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::provider::Provider;
use crate::schema::Shape;

use super::{complete_within, Generation, Plan};

const OBJECT_SYSTEM: &str = "You are a function. Respond with a single JSON object and nothing else.";
const ARRAY_SYSTEM: &str = "You are a function. Respond with a JSON object whose `items` field is an array of JSON objects, and nothing else.";

pub fn object_prompt(plan: &Plan<'_>) -> (String, String) {
    let mut system = OBJECT_SYSTEM.to_string();
    if let Some(shape) = plan.shape {
        system.push_str("\nThe object must match this JSON Schema:\n");
        system.push_str(&shape.to_json_schema().to_string());
    }
    (system, plan.user_prompt())
}

pub fn array_prompt(plan: &Plan<'_>) -> (String, String) {
    let mut system = ARRAY_SYSTEM.to_string();
    if let Some(item) = plan.shape.map(item_shape) {
        system.push_str("\nEach item must match this JSON Schema:\n");
        system.push_str(&item.to_json_schema().to_string());
    }
    (system, plan.user_prompt())
}

/// The per-item shape of an array shape (`[{...}]` and `{...}` both work).
pub fn item_shape(shape: &Shape) -> &Shape {
    match shape {
        Shape::Array(item) => item,
        other => other,
    }
}

fn array_schema(item: &Shape) -> Value {
    json!({
        "type": "object",
        "properties": {"items": {"type": "array", "items": item.to_json_schema()}},
        "required": ["items"],
        "additionalProperties": false,
    })
}

pub async fn generate_object(provider: &dyn Provider, plan: &Plan<'_>) -> Generation {
    let (system, user) = object_prompt(plan);
    let mut request = plan.completion_request(system, user);
    if let Some(shape) = plan.shape.filter(|s| s.is_object()) {
        request = request.with_response_schema(shape.to_json_schema());
    }

    match complete_within(provider, &request, plan.timeout_ms).await {
        Ok(completion) => {
            let output = parse_object(&completion.text);
            let generation = Generation::new(output, completion.reasoning);
            if generation.output.get("_error").is_some() {
                generation.uncacheable()
            } else {
                generation
            }
        }
        Err(e) => Generation::failed(e.to_string()),
    }
}

pub async fn generate_object_array(provider: &dyn Provider, plan: &Plan<'_>) -> Generation {
    let (system, user) = array_prompt(plan);
    let mut request = plan.completion_request(system, user);
    if let Some(item) = plan.shape.map(item_shape) {
        request = request.with_response_schema(array_schema(item));
    }

    match complete_within(provider, &request, plan.timeout_ms).await {
        Ok(completion) => match parse_array(&completion.text) {
            Some(items) => Generation::new(Value::Array(items), completion.reasoning),
            None => Generation::new(
                json!({
                    "_error": "model output is not a JSON array",
                    "raw_response": completion.text,
                }),
                completion.reasoning,
            )
            .uncacheable(),
        },
        Err(e) => Generation::failed(e.to_string()),
    }
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) along with the opening fence.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse a model reply as JSON. Malformed replies yield whatever fields can
/// be salvaged plus `_error` and `raw_response`.
pub fn parse_object(text: &str) -> Value {
    let body = strip_fences(text);
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return value;
    }
    if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&body[start..=end]) {
                return value;
            }
        }
    }

    let mut salvaged = salvage_fields(body);
    salvaged.insert("_error".into(), json!("model output is not valid JSON"));
    salvaged.insert("raw_response".into(), json!(text));
    Value::Object(salvaged)
}

/// Accepts a bare array, `{ "items": [...] }`, or any object with exactly one
/// array field.
pub fn parse_array(text: &str) -> Option<Vec<Value>> {
    let body = strip_fences(text);
    let value = serde_json::from_str::<Value>(body).ok().or_else(|| {
        let start = body.find('[')?;
        let end = body.rfind(']')?;
        (start < end)
            .then(|| serde_json::from_str::<Value>(&body[start..=end]).ok())
            .flatten()
    })?;

    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            if let Some(Value::Array(items)) = map.remove("items") {
                return Some(items);
            }
            let mut arrays = map.into_iter().filter_map(|(_, v)| match v {
                Value::Array(items) => Some(items),
                _ => None,
            });
            match (arrays.next(), arrays.next()) {
                (Some(items), None) => Some(items),
                _ => None,
            }
        }
        _ => None,
    }
}

fn field_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#""([A-Za-z_][\w-]*)"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?|true|false|null)"#).ok()
        })
        .as_ref()
}

/// Scalar `"key": value` pairs that survive in truncated or chatty output.
fn salvage_fields(text: &str) -> Map<String, Value> {
    let Some(pattern) = field_pattern() else {
        return Map::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_string();
            let value = serde_json::from_str::<Value>(caps.get(2)?.as_str()).ok()?;
            Some((key, value))
        })
        .collect()
}
