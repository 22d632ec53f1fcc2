//! Subprocess sandbox using `tokio::process`.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::error::{ExecError, ExecResult};

use super::{CodeSandbox, SandboxLimits, SandboxOutcome};

/// Runs code through an interpreter subprocess.
///
/// The code is written to the interpreter's stdin and the arguments are
/// exposed as JSON in `EXEC_ARGS`. The last non-empty stdout line is the
/// result: parsed as JSON when possible, otherwise kept as a string.
pub struct NativeSandbox {
    interpreter: String,
}

impl NativeSandbox {
    pub fn new() -> Self {
        Self::with_interpreter("node")
    }

    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    fn command_line(&self, limits: SandboxLimits) -> String {
        let kb = limits.memory_limit_mb.saturating_mul(1024);
        format!("ulimit -v {kb} 2>/dev/null; exec {}", self.interpreter)
    }
}

impl Default for NativeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_result(stdout: &str) -> Value {
    match stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string())),
        None => Value::Null,
    }
}

impl CodeSandbox for NativeSandbox {
    fn run<'a>(
        &'a self,
        code: &'a str,
        args: &'a Map<String, Value>,
        limits: SandboxLimits,
    ) -> Pin<Box<dyn Future<Output = ExecResult<SandboxOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(self.command_line(limits))
                .env("EXEC_ARGS", serde_json::to_string(args)?)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .map_err(|e| ExecError::Sandbox(format!("Failed to spawn {}: {e}", self.interpreter)))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(code.as_bytes()).await?;
                stdin.shutdown().await?;
            }

            let output = tokio::time::timeout(
                Duration::from_millis(limits.timeout_ms),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ExecError::Timeout {
                timeout_ms: limits.timeout_ms,
            })??;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            if !output.status.success() {
                let code = output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into());
                let detail = stderr.trim();
                return Ok(SandboxOutcome {
                    result: parse_result(&stdout),
                    error: Some(format!("exit {code}: {detail}")),
                });
            }

            Ok(SandboxOutcome::ok(parse_result(&stdout)))
        })
    }
}
