//! Output shapes: parsing the shape description language, translating it to
//! JSON Schema for the model, and validating generated candidates against it.
//!
//! Shape descriptions are plain JSON:
//!
//! ```text
//! {
//!   "category":    "string",
//!   "price":       "number",
//!   "inStock":     "boolean",
//!   "tags":        "string[]",
//!   "sentiment":   "positive | negative | neutral",
//!   "summary?":    "a one-line summary",        // optional, described string
//!   "variants":    [{ "name": "string", "sku": "string" }]
//! }
//! ```

use chrono::{DateTime, NaiveDate};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Parsed shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    String { description: Option<String> },
    Number,
    Integer,
    Boolean,
    Date,
    Enum(Vec<String>),
    Array(Box<Shape>),
    Object(Vec<Field>),
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub shape: Shape,
    pub required: bool,
}

impl Shape {
    /// Parse a shape description. Anything unrecognized degrades to a
    /// described string or `Any`; parsing never fails.
    pub fn parse(value: &Value) -> Shape {
        match value {
            Value::String(s) => parse_type_str(s).0,
            Value::Object(map) => Shape::Object(parse_fields(map)),
            Value::Array(items) => match items.first() {
                Some(item) => Shape::Array(Box::new(Shape::parse(item))),
                None => Shape::Array(Box::new(Shape::Any)),
            },
            Value::Number(n) if n.is_i64() || n.is_u64() => Shape::Integer,
            Value::Number(_) => Shape::Number,
            Value::Bool(_) => Shape::Boolean,
            Value::Null => Shape::Any,
        }
    }

    /// Translate to JSON Schema (the model provider's structured-output language).
    pub fn to_json_schema(&self) -> Value {
        match self {
            Shape::String { description } => {
                let mut schema = json!({"type": "string"});
                if let Some(d) = description {
                    schema["description"] = json!(d);
                }
                schema
            }
            Shape::Number => json!({"type": "number"}),
            Shape::Integer => json!({"type": "integer"}),
            Shape::Boolean => json!({"type": "boolean"}),
            // No `format`: validation takes both plain dates and date-times.
            Shape::Date => json!({
                "type": "string",
                "description": "a date as YYYY-MM-DD or an RFC 3339 date-time"
            }),
            Shape::Enum(options) => json!({"type": "string", "enum": options}),
            Shape::Array(item) => json!({"type": "array", "items": item.to_json_schema()}),
            Shape::Object(fields) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields {
                    properties.insert(field.name.clone(), field.shape.to_json_schema());
                    if field.required {
                        required.push(json!(field.name));
                    }
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": false,
                })
            }
            Shape::Any => json!({}),
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Shape::Object(_))
    }
}

fn parse_fields(map: &Map<String, Value>) -> Vec<Field> {
    map.iter()
        .map(|(key, value)| {
            let (name, key_optional) = match key.strip_suffix('?') {
                Some(stripped) => (stripped.to_string(), true),
                None => (key.clone(), false),
            };
            let (shape, value_optional) = match value {
                Value::String(s) => parse_type_str(s),
                other => (Shape::parse(other), false),
            };
            Field {
                name,
                shape,
                required: !(key_optional || value_optional),
            }
        })
        .collect()
}

/// Returns the shape and whether a trailing `?` marked it optional.
fn parse_type_str(raw: &str) -> (Shape, bool) {
    let trimmed = raw.trim();
    let (body, optional) = match trimmed.strip_suffix('?') {
        Some(b) if is_type_word(b.trim_end_matches("[]")) => (b.trim(), true),
        _ => (trimmed, false),
    };

    if let Some(inner) = body.strip_suffix("[]") {
        let (item, _) = parse_type_str(inner);
        return (Shape::Array(Box::new(item)), optional);
    }

    if body.contains('|') {
        let options: Vec<String> = body
            .split('|')
            .map(|o| o.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        if options.len() > 1 {
            return (Shape::Enum(options), optional);
        }
    }

    let shape = match body.to_lowercase().as_str() {
        "string" | "text" | "str" => Shape::String { description: None },
        "number" | "float" | "double" => Shape::Number,
        "integer" | "int" => Shape::Integer,
        "boolean" | "bool" => Shape::Boolean,
        "date" | "datetime" | "date-time" => Shape::Date,
        "any" | "json" | "object" => Shape::Any,
        _ => Shape::String {
            description: Some(body.to_string()),
        },
    };
    (shape, optional)
}

fn is_type_word(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "string" | "text" | "str" | "number" | "float" | "double" | "integer" | "int"
            | "boolean" | "bool" | "date" | "datetime" | "date-time" | "any" | "json" | "object"
    )
}

// ─── Validation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Coerce `candidate` into `shape`. On failure the original candidate comes
/// back untouched apart from an added `_validation_error` key.
pub fn validate(shape: &Shape, candidate: Value) -> Value {
    let mut issues = Vec::new();
    let coerced = coerce(shape, &candidate, "$", &mut issues);
    if issues.is_empty() {
        coerced
    } else {
        annotate(candidate, &issues)
    }
}

/// Validate each element independently; one bad item does not taint the rest.
pub fn validate_items(item_shape: &Shape, items: Vec<Value>) -> Vec<Value> {
    items
        .into_iter()
        .map(|item| validate(item_shape, item))
        .collect()
}

/// Whether a value carries a validation annotation.
pub fn has_validation_error(value: &Value) -> bool {
    value.get("_validation_error").is_some()
}

fn annotate(candidate: Value, issues: &[ValidationIssue]) -> Value {
    let summary = issues
        .iter()
        .map(|i| format!("{}: {}", i.path, i.message))
        .collect::<Vec<_>>()
        .join("; ");
    let error = json!({
        "message": format!("{} issue(s): {summary}", issues.len()),
        "details": issues,
    });
    match candidate {
        Value::Object(mut map) => {
            map.insert("_validation_error".into(), error);
            Value::Object(map)
        }
        other => json!({"raw": other, "_validation_error": error}),
    }
}

fn issue(issues: &mut Vec<ValidationIssue>, path: &str, message: impl Into<String>) {
    issues.push(ValidationIssue {
        path: path.to_string(),
        message: message.into(),
    });
}

fn coerce(shape: &Shape, value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) -> Value {
    match shape {
        Shape::Any => value.clone(),
        Shape::String { .. } => match value {
            Value::String(_) => value.clone(),
            Value::Number(n) => json!(n.to_string()),
            Value::Bool(b) => json!(b.to_string()),
            _ => {
                issue(issues, path, "expected string");
                value.clone()
            }
        },
        Shape::Number => match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => match s.trim().parse::<f64>().ok().and_then(|f| serde_json::Number::from_f64(f)) {
                Some(n) => Value::Number(n),
                None => {
                    issue(issues, path, format!("expected number, got {s:?}"));
                    value.clone()
                }
            },
            _ => {
                issue(issues, path, "expected number");
                value.clone()
            }
        },
        Shape::Integer => match as_integer(value) {
            Some(i) => json!(i),
            None => {
                issue(issues, path, "expected integer");
                value.clone()
            }
        },
        Shape::Boolean => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => json!(true),
                "false" | "no" | "n" | "0" => json!(false),
                _ => {
                    issue(issues, path, format!("expected boolean, got {s:?}"));
                    value.clone()
                }
            },
            Value::Number(n) if n.as_i64() == Some(0) => json!(false),
            Value::Number(n) if n.as_i64() == Some(1) => json!(true),
            _ => {
                issue(issues, path, "expected boolean");
                value.clone()
            }
        },
        Shape::Date => match value {
            Value::String(s) if is_date(s) => value.clone(),
            _ => {
                issue(issues, path, "expected ISO-8601 date");
                value.clone()
            }
        },
        Shape::Enum(options) => {
            let text = match value {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
            match text.and_then(|t| options.iter().find(|o| o.eq_ignore_ascii_case(&t))) {
                Some(canonical) => json!(canonical),
                None => {
                    issue(issues, path, format!("expected one of {}", options.join(", ")));
                    value.clone()
                }
            }
        }
        Shape::Array(item) => match value {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| coerce(item, v, &format!("{path}[{i}]"), issues))
                    .collect(),
            ),
            Value::Null => {
                issue(issues, path, "expected array");
                value.clone()
            }
            single => Value::Array(vec![coerce(item, single, &format!("{path}[0]"), issues)]),
        },
        Shape::Object(fields) => match value {
            Value::Object(map) => {
                let mut out = map.clone();
                for field in fields {
                    let field_path = format!("{path}.{}", field.name);
                    match map.get(&field.name) {
                        Some(v) if !v.is_null() => {
                            out.insert(field.name.clone(), coerce(&field.shape, v, &field_path, issues));
                        }
                        _ if field.required => issue(issues, &field_path, "missing required field"),
                        _ => {}
                    }
                }
                Value::Object(out)
            }
            _ => {
                issue(issues, path, "expected object");
                value.clone()
            }
        },
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        }
        _ => None,
    }
}

fn is_date(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s.trim()).is_ok()
        || NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok()
}
