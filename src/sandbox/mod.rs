//! Code sandbox: runs a function's embedded code against its arguments.
//!
//! [`CodeSandbox`] decouples code execution from whatever isolates it. Ships
//! with [`NativeSandbox`] (behind the `native` feature) for a real subprocess
//! bounded by a wall clock and a virtual-memory limit, and [`NoopSandbox`]
//! for environments without one.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ExecResult;

/// Resource bounds for one sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            memory_limit_mb: 128,
        }
    }
}

/// What the code produced. A non-empty `error` does not fail the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SandboxOutcome {
    pub fn ok(result: Value) -> Self {
        Self { result, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Some(error.into()),
        }
    }
}

pub trait CodeSandbox: Send + Sync {
    fn run<'a>(
        &'a self,
        code: &'a str,
        args: &'a Map<String, Value>,
        limits: SandboxLimits,
    ) -> Pin<Box<dyn Future<Output = ExecResult<SandboxOutcome>> + Send + 'a>>;
}

// ─── NoopSandbox ───────────────────────────────────────────────────────────

/// Sandbox that never runs anything.
pub struct NoopSandbox;

impl CodeSandbox for NoopSandbox {
    fn run<'a>(
        &'a self,
        _code: &'a str,
        _args: &'a Map<String, Value>,
        _limits: SandboxLimits,
    ) -> Pin<Box<dyn Future<Output = ExecResult<SandboxOutcome>> + Send + 'a>> {
        Box::pin(async {
            Ok(SandboxOutcome::failed(
                "Code execution not available in this environment",
            ))
        })
    }
}

// ─── MockSandbox for testing ───────────────────────────────────────────────

/// Test sandbox with canned outcomes; records every run.
pub struct MockSandbox {
    outcomes: std::sync::Mutex<Vec<SandboxOutcome>>,
    runs: std::sync::Mutex<Vec<(String, Map<String, Value>, SandboxLimits)>>,
}

impl MockSandbox {
    pub fn new(outcomes: Vec<SandboxOutcome>) -> Self {
        Self {
            outcomes: std::sync::Mutex::new(outcomes),
            runs: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn always(result: Value) -> Self {
        Self::new(vec![SandboxOutcome::ok(result); 100])
    }

    pub fn runs(&self) -> Vec<(String, Map<String, Value>, SandboxLimits)> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl CodeSandbox for MockSandbox {
    fn run<'a>(
        &'a self,
        code: &'a str,
        args: &'a Map<String, Value>,
        limits: SandboxLimits,
    ) -> Pin<Box<dyn Future<Output = ExecResult<SandboxOutcome>> + Send + 'a>> {
        Box::pin(async move {
            if let Ok(mut runs) = self.runs.lock() {
                runs.push((code.to_string(), args.clone(), limits));
            }
            let next = self
                .outcomes
                .lock()
                .ok()
                .and_then(|mut o| (!o.is_empty()).then(|| o.remove(0)));
            Ok(next.unwrap_or_else(|| SandboxOutcome::failed("No more mock outcomes")))
        })
    }
}

// ─── NativeSandbox (behind `native` feature) ───────────────────────────────

#[cfg(feature = "native")]
mod native;
#[cfg(feature = "native")]
pub use native::NativeSandbox;
