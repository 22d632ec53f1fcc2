//! Generation strategies: one handler per [`ExecutionKind`].
//!
//! - `object`: structured objects and arrays of objects (JSON mode)
//! - `text`: markdown and numbered-list text arrays
//! - `code`: embedded code in the sandbox
//! - `human`: human feedback tasks
//! - `agent`: delegation to a named agent
//!
//! Handlers never fail: provider errors and timeouts come back as an
//! `{ "_error": ... }` output that is returned to the caller but not cached.

pub mod agent;
pub mod code;
pub mod human;
pub mod object;
pub mod text;

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::dispatch::Dispatch;
use crate::error::{ExecError, ExecResult};
use crate::execlog::ExecLogger;
use crate::hash::RequestHashes;
use crate::provider::{Completion, CompletionRequest, Provider};
use crate::scheduler::Scheduler;
use crate::schema::Shape;
use crate::store::RecordStore;
use crate::types::{ActionRecord, ExecutionKind, Message, Request, TaskRecord};

/// Output of one handler run.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub output: Value,
    pub reasoning: Option<String>,
    /// Failed or refused generations are returned but never cached.
    pub cacheable: bool,
}

impl Generation {
    pub fn new(output: Value, reasoning: Option<String>) -> Self {
        Self {
            output,
            reasoning,
            cacheable: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            output: json!({ "_error": message.into() }),
            reasoning: None,
            cacheable: false,
        }
    }

    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// Everything a handler needs to know about the request it serves.
#[derive(Debug, Clone)]
pub struct Plan<'a> {
    pub request: &'a Request,
    pub hashes: &'a RequestHashes,
    pub dispatch: &'a Dispatch,
    pub shape: Option<&'a Shape>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Plan<'_> {
    pub fn kind(&self) -> ExecutionKind {
        self.dispatch.kind
    }

    pub fn completion_request(&self, system: String, user: String) -> CompletionRequest {
        CompletionRequest::new(self.model.clone())
            .with_message(Message::system(system))
            .with_message(Message::user(user))
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }

    /// User turn: the call expression plus any extra instructions.
    pub fn user_prompt(&self) -> String {
        match self.request.settings.prompt.as_deref() {
            Some(extra) if !extra.trim().is_empty() => {
                format!("{}\n\n{}", self.request.call_expression(), extra.trim())
            }
            _ => self.request.call_expression(),
        }
    }

    /// Cache entry for this request holding `result`.
    pub fn action(&self, result: Value, reasoning: Option<String>) -> ActionRecord {
        ActionRecord {
            hash: self.hashes.request.clone(),
            function: self.request.function_name.clone(),
            arguments_hash: self.hashes.args.clone(),
            shape_hash: self.hashes.shape.clone(),
            kind: self.dispatch.kind,
            result,
            reasoning,
            created_at: Utc::now(),
        }
    }
}

/// Collaborators the deferred handlers (human, agent) write through.
pub struct Deferred<'a> {
    pub store: &'a dyn RecordStore,
    pub scheduler: &'a Scheduler,
    pub logger: &'a ExecLogger,
    pub human_timeout_ms: u64,
}

/// Replace a pending envelope whose follow-up could not be queued. Error
/// results are never served from the cache, so this also invalidates it.
async fn abandon(deferred: &Deferred<'_>, task: TaskRecord, action: ActionRecord) {
    let hash = action.hash.clone();
    if let Err(e) = deferred.store.put_task(task).await {
        deferred.logger.warn("dispatch", Some(&hash), &format!("task record not stored: {e}"));
    }
    if let Err(e) = deferred.store.put_action(action).await {
        deferred.logger.warn("dispatch", Some(&hash), &format!("action not replaced: {e}"));
    }
}

/// Whether a result is an error envelope: `_error` from any handler, or
/// `error` from a deferred handler whose follow-up was never queued.
pub fn is_error_result(kind: ExecutionKind, output: &Value) -> bool {
    output.get("_error").is_some() || (kind.is_deferred() && output.get("error").is_some())
}

/// Run a provider call under the plan's timeout.
pub async fn complete_within(
    provider: &dyn Provider,
    request: &CompletionRequest,
    timeout_ms: u64,
) -> ExecResult<Completion> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), provider.complete(request))
        .await
        .map_err(|_| ExecError::Timeout { timeout_ms })?
}

/// Prompt pair (system, user) a streamed generation of `plan` would use.
pub fn stream_prompt(plan: &Plan<'_>) -> (String, String) {
    match plan.kind() {
        ExecutionKind::Object => object::object_prompt(plan),
        ExecutionKind::ObjectArray => object::array_prompt(plan),
        ExecutionKind::TextArray => text::list_prompt(plan),
        _ => text::markdown_prompt(plan),
    }
}

/// Incremental text fragments of one generation.
///
/// Ends when the generation finishes. Never validated; the assembled text
/// is persisted once the last fragment has been produced.
pub struct GenerationStream {
    rx: mpsc::UnboundedReceiver<String>,
    generation_hash: String,
    cached: bool,
}

impl GenerationStream {
    pub fn new(rx: mpsc::UnboundedReceiver<String>, generation_hash: impl Into<String>) -> Self {
        Self {
            rx,
            generation_hash: generation_hash.into(),
            cached: false,
        }
    }

    /// A stream that yields a finished output as a single fragment.
    pub fn once(generation_hash: impl Into<String>, output: &Value, cached: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(render(output));
        Self {
            rx,
            generation_hash: generation_hash.into(),
            cached,
        }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain the rest of the stream into one string.
    pub async fn collect(mut self) -> String {
        let mut text = String::new();
        while let Some(fragment) = self.rx.recv().await {
            text.push_str(&fragment);
        }
        text
    }

    pub fn generation_hash(&self) -> &str {
        &self.generation_hash
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

/// Text form of an output: strings verbatim, everything else as JSON.
pub fn render(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
