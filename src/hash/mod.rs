//! Content addressing for requests.
//!
//! Every value is canonicalized (object keys sorted recursively) before it is
//! serialized and hashed, so two requests that differ only in key insertion
//! order share a digest. Digests are lowercase hex SHA-256 and stable across
//! process restarts.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::{Request, Settings};

/// Recursively sort object keys. Arrays keep their order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical compact JSON text for a value.
pub fn canonical_json(value: &Value) -> String {
    // Keys are written in sorted order regardless of the map backing.
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Digest over the full `(function, args, shape, settings)` tuple.
pub fn request_hash(request: &Request) -> String {
    let tuple = serde_json::json!({
        "function": request.function_name,
        "kind": request.kind,
        "args": Value::Object(request.args.clone()),
        "shape": request.shape.clone().unwrap_or(Value::Null),
        "settings": settings_value(&request.settings),
    });
    digest(&tuple)
}

/// Digest over the argument map alone.
pub fn args_hash(args: &Map<String, Value>) -> String {
    digest(&Value::Object(args.clone()))
}

/// Digest over the shape alone.
pub fn shape_hash(shape: &Value) -> String {
    digest(shape)
}

/// The three digests the engine computes for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHashes {
    pub request: String,
    pub args: String,
    pub shape: Option<String>,
}

impl RequestHashes {
    pub fn compute(request: &Request) -> Self {
        Self {
            request: request_hash(request),
            args: args_hash(&request.args),
            shape: request.shape.as_ref().map(shape_hash),
        }
    }
}

fn settings_value(settings: &Settings) -> Value {
    serde_json::to_value(settings).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [ {"y": 1, "x": 2} ]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = digest(&json!({"a": 1}));
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_eq!(d, digest(&json!({"a": 1})));
    }

    #[test]
    fn digest_of_known_value() {
        // sha256 of the string `{"a":1}`
        assert_eq!(
            digest(&json!({"a": 1})),
            "015abd7f5cc57a2dd94b7590f04ad8084273905ee33ec5cebeae62276a97f862"
        );
    }

    #[test]
    fn request_hash_ignores_key_order() {
        let a: Request = serde_json::from_str(
            r#"{"functionName":"f","args":{"x":1,"y":{"p":1,"q":2}},"settings":{"model":"m","userId":"u"}}"#,
        )
        .unwrap();
        let b: Request = serde_json::from_str(
            r#"{"settings":{"userId":"u","model":"m"},"args":{"y":{"q":2,"p":1},"x":1},"functionName":"f"}"#,
        )
        .unwrap();
        assert_eq!(request_hash(&a), request_hash(&b));
    }

    #[test]
    fn request_hash_changes_with_each_component() {
        let base = Request::new("f").with_arg("x", json!(1));
        let h = request_hash(&base);
        assert_ne!(h, request_hash(&Request::new("g").with_arg("x", json!(1))));
        assert_ne!(h, request_hash(&base.clone().with_arg("x", json!(2))));
        assert_ne!(h, request_hash(&base.clone().with_shape(json!({"a": "string"}))));
        let mut settings = Settings::default();
        settings.model = Some("other".into());
        assert_ne!(h, request_hash(&base.clone().with_settings(settings)));
    }

    #[test]
    fn args_hash_is_independent_of_function() {
        let a = Request::new("f").with_arg("x", json!(1));
        let b = Request::new("g").with_arg("x", json!(1));
        assert_eq!(args_hash(&a.args), args_hash(&b.args));
    }

    #[test]
    fn hashes_compute_all_three() {
        let req = Request::new("f")
            .with_arg("x", json!(1))
            .with_shape(json!({"a": "string"}));
        let hashes = RequestHashes::compute(&req);
        assert_eq!(hashes.request, request_hash(&req));
        assert_eq!(hashes.args, args_hash(&req.args));
        assert_eq!(hashes.shape, Some(shape_hash(&json!({"a": "string"}))));

        let no_shape = RequestHashes::compute(&Request::new("f"));
        assert!(no_shape.shape.is_none());
    }
}
