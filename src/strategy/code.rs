//! Sandboxed-code execution.

use serde_json::Value;

use crate::sandbox::{CodeSandbox, SandboxLimits};

use super::{Generation, Plan};

/// Run the function's embedded code against the request arguments. Sandbox
/// failures land in `reasoning`; the call itself still succeeds.
pub async fn run_code(sandbox: &dyn CodeSandbox, plan: &Plan<'_>, limits: SandboxLimits) -> Generation {
    let Some(code) = plan.dispatch.code.as_deref() else {
        return Generation::failed("no code to run");
    };

    match sandbox.run(code, &plan.request.args, limits).await {
        Ok(outcome) => match outcome.error {
            None => Generation::new(outcome.result, None),
            Some(error) => Generation::new(outcome.result, Some(error)).uncacheable(),
        },
        Err(e) => Generation::new(Value::Null, Some(e.to_string())).uncacheable(),
    }
}
