use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::telemetry::Latencies;

// ─── Request ────────────────────────────────────────────────────────────────

/// A single invocation: `function_name(args)`, optionally shaped.
///
/// Immutable once hashed; the engine only ever borrows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub function_name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Recursive shape description of the expected output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Value>,
    /// Explicit execution kind label (`request.type`).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub settings: Settings,
}

impl Request {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            ..Default::default()
        }
    }

    /// Replace the argument map. Non-object values are stored under `value`.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn with_shape(mut self, shape: Value) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// `functionName({"name":"iPhone 15"})`: the canonical call expression.
    pub fn call_expression(&self) -> String {
        let args = serde_json::to_string(&self.args).unwrap_or_else(|_| "{}".into());
        format!("{}({})", self.function_name, args)
    }
}

/// Per-request settings. Unknown keys are kept in `extra` and still take part
/// in the request hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Cache time-to-live in milliseconds.
    #[serde(
        default,
        rename = "cacheTTL",
        alias = "cacheTtl",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_ttl: Option<u64>,
    /// Generation timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    /// Where to forward the final result once it exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<Callback>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Delivery instructions: either a bare URL or a full target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Callback {
    Url(String),
    Target(DeliveryTarget),
}

impl Callback {
    pub fn target(&self) -> DeliveryTarget {
        match self {
            Callback::Url(url) => DeliveryTarget::new(url.clone()),
            Callback::Target(target) => target.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl DeliveryTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

// ─── Execution Kind ─────────────────────────────────────────────────────────

/// How a function is executed on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionKind {
    /// Structured JSON object generation (the default).
    Object,
    /// Free-form markdown.
    Text,
    /// Markdown constrained to a numbered list, parsed back into strings.
    TextArray,
    /// JSON array of objects, validated per item.
    ObjectArray,
    /// Embedded code run in the sandbox.
    Code,
    /// Human-in-the-loop feedback request.
    Human,
    /// Delegation to a named agent.
    Agent,
}

impl ExecutionKind {
    /// Parse a loosely-written kind label. Unknown labels yield `None`.
    pub fn parse_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "object" | "structuredobject" | "generation" | "generate" | "json" => {
                Some(ExecutionKind::Object)
            }
            "text" | "markdown" | "md" => Some(ExecutionKind::Text),
            "textarray" | "list" | "strings" => Some(ExecutionKind::TextArray),
            "objectarray" | "array" | "objects" => Some(ExecutionKind::ObjectArray),
            "code" => Some(ExecutionKind::Code),
            "human" | "humanfeedback" => Some(ExecutionKind::Human),
            "agent" => Some(ExecutionKind::Agent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Object => "object",
            ExecutionKind::Text => "text",
            ExecutionKind::TextArray => "text-array",
            ExecutionKind::ObjectArray => "object-array",
            ExecutionKind::Code => "code",
            ExecutionKind::Human => "human",
            ExecutionKind::Agent => "agent",
        }
    }

    /// Output format recorded on lazily-created function records.
    pub fn output_format(&self) -> &'static str {
        match self {
            ExecutionKind::Object | ExecutionKind::Code => "json",
            ExecutionKind::ObjectArray => "json-array",
            ExecutionKind::Text => "markdown",
            ExecutionKind::TextArray => "list",
            ExecutionKind::Human | ExecutionKind::Agent => "task",
        }
    }

    /// Kinds whose synchronous result is a pending placeholder.
    pub fn is_deferred(&self) -> bool {
        matches!(self, ExecutionKind::Human | ExecutionKind::Agent)
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── Records ────────────────────────────────────────────────────────────────

/// Canonical function definition. Created lazily, never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRecord {
    pub name: String,
    pub kind: ExecutionKind,
    pub output_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl FunctionRecord {
    pub fn new(name: impl Into<String>, kind: ExecutionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            output_format: kind.output_format().to_string(),
            code: None,
            agent_id: None,
            shape: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_shape(mut self, shape: Value) -> Self {
        self.shape = Some(shape);
        self
    }
}

/// Canonical argument set ("thing"), keyed by its args hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentRecord {
    pub hash: String,
    pub args: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Canonical output shape ("type"), keyed by its shape hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeRecord {
    pub hash: String,
    pub shape: Value,
    /// The shape translated to JSON Schema.
    pub schema: Value,
    pub created_at: DateTime<Utc>,
}

/// The cache entry: `(function, args, shape, settings) -> result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub hash: String,
    pub function: String,
    pub arguments_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_hash: Option<String>,
    pub kind: ExecutionKind,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit entry for every execution, hit or miss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub hash: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExecutionKind>,
    pub cached: bool,
    pub args: Map<String, Value>,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub latencies: Latencies,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(hash: impl Into<String>, request: &Request) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            hash: hash.into(),
            function: request.function_name.clone(),
            kind: None,
            cached: false,
            args: request.args.clone(),
            output: Value::Null,
            reasoning: None,
            latencies: Latencies::default(),
            user_id: request.settings.user_id.clone(),
            role_id: request.settings.role_id.clone(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

/// Tracks a deferred (human or agent) execution until it resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub kind: ExecutionKind,
    pub status: TaskStatus,
    /// Request hash whose action this task will supersede.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn pending(id: impl Into<String>, kind: ExecutionKind, hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: TaskStatus::Pending,
            hash: hash.into(),
            job_id: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete(mut self, result: Value) -> Self {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.updated_at = Utc::now();
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
        self
    }
}

// ─── Execution Envelope ─────────────────────────────────────────────────────

/// What `execute` returns. `output` is always present, including pending
/// placeholders for human and agent executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub generation_hash: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExecutionKind>,
    pub latencies: Latencies,
}

// ─── Model Messages ─────────────────────────────────────────────────────────

/// Role in a model conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_deserializes_from_wire_shape() {
        let req: Request = serde_json::from_value(json!({
            "functionName": "categorizeProduct",
            "args": {"name": "iPhone 15"},
            "shape": {"category": "string"},
            "settings": {"model": "gpt-4o", "cacheTTL": 1000, "userId": "u1", "custom": 3}
        }))
        .unwrap();
        assert_eq!(req.function_name, "categorizeProduct");
        assert_eq!(req.args["name"], "iPhone 15");
        assert_eq!(req.settings.cache_ttl, Some(1000));
        assert_eq!(req.settings.user_id.as_deref(), Some("u1"));
        assert_eq!(req.settings.extra["custom"], 3);
    }

    #[test]
    fn settings_type_field_maps_to_kind() {
        let settings: Settings = serde_json::from_value(json!({"type": "Human"})).unwrap();
        assert_eq!(settings.kind.as_deref(), Some("Human"));
    }

    #[test]
    fn callback_accepts_url_or_target() {
        let settings: Settings =
            serde_json::from_value(json!({"callback": "https://hooks.example.com/a"})).unwrap();
        assert_eq!(
            settings.callback.unwrap().target().url,
            "https://hooks.example.com/a"
        );

        let settings: Settings = serde_json::from_value(json!({
            "callback": {"url": "https://hooks.example.com/b", "headers": {"x-token": "t"}}
        }))
        .unwrap();
        let target = settings.callback.unwrap().target();
        assert_eq!(target.url, "https://hooks.example.com/b");
        assert_eq!(target.headers["x-token"], "t");
    }

    #[test]
    fn with_args_wraps_scalars() {
        let req = Request::new("double").with_args(json!(21));
        assert_eq!(req.args["value"], 21);
        let req = Request::new("noop").with_args(Value::Null);
        assert!(req.args.is_empty());
    }

    #[test]
    fn call_expression_formats() {
        let req = Request::new("categorizeProduct").with_arg("name", json!("iPhone 15"));
        assert_eq!(
            req.call_expression(),
            r#"categorizeProduct({"name":"iPhone 15"})"#
        );
    }

    #[test]
    fn kind_labels_parse_loosely() {
        assert_eq!(ExecutionKind::parse_label("Human"), Some(ExecutionKind::Human));
        assert_eq!(ExecutionKind::parse_label("AGENT"), Some(ExecutionKind::Agent));
        assert_eq!(
            ExecutionKind::parse_label("text-array"),
            Some(ExecutionKind::TextArray)
        );
        assert_eq!(
            ExecutionKind::parse_label("ObjectArray"),
            Some(ExecutionKind::ObjectArray)
        );
        assert_eq!(ExecutionKind::parse_label("markdown"), Some(ExecutionKind::Text));
        assert_eq!(ExecutionKind::parse_label("telepathy"), None);
    }

    #[test]
    fn kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ExecutionKind::ObjectArray).unwrap(),
            "\"object-array\""
        );
        assert_eq!(ExecutionKind::TextArray.to_string(), "text-array");
    }

    #[test]
    fn task_record_transitions() {
        let task = TaskRecord::pending("t1", ExecutionKind::Agent, "h");
        assert_eq!(task.status, TaskStatus::Pending);
        let done = task.clone().complete(json!({"ok": true}));
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"ok": true})));
        let failed = task.fail("boom");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn function_record_defaults_output_format() {
        let rec = FunctionRecord::new("summarize", ExecutionKind::Text);
        assert_eq!(rec.output_format, "markdown");
        assert!(rec.code.is_none());
    }
}
