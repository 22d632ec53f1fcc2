//! Dispatcher: decides how a cache miss is generated.
//!
//! The kind comes from the first recognizable label in order of precedence:
//! `request.type`, `settings.type`, the stored function record, and finally
//! the output shape (an array shape means an array of objects). Everything
//! else is a structured object.

use serde_json::Value;

use crate::error::{ExecError, ExecResult};
use crate::types::{ExecutionKind, FunctionRecord, Request};

/// Where a request goes and what its handler needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub kind: ExecutionKind,
    /// Set for [`ExecutionKind::Agent`].
    pub agent_id: Option<String>,
    /// Set for [`ExecutionKind::Code`].
    pub code: Option<String>,
}

impl Dispatch {
    fn plain(kind: ExecutionKind) -> Self {
        Self {
            kind,
            agent_id: None,
            code: None,
        }
    }
}

/// The kind the caller asked for: `request.kind`, then `settings.type`.
/// Unparseable labels are skipped.
pub fn labelled_kind(request: &Request) -> Option<ExecutionKind> {
    [request.kind.as_deref(), request.settings.kind.as_deref()]
        .into_iter()
        .flatten()
        .find_map(ExecutionKind::parse_label)
}

/// Pick the execution kind for `request`. Only a delegation without an agent
/// id fails, and it fails before anything external is called.
///
/// A record of kind `Object` is the default and leaves the choice between
/// object, object array and text array to the request's shape.
pub fn classify(request: &Request, record: Option<&FunctionRecord>) -> ExecResult<Dispatch> {
    let kind = labelled_kind(request)
        .or_else(|| record.map(|r| r.kind).filter(|k| *k != ExecutionKind::Object))
        .unwrap_or_else(|| kind_from_shape(request.shape.as_ref()));

    match kind {
        ExecutionKind::Code => {
            match record.and_then(|r| r.code.as_deref()).filter(|c| !c.trim().is_empty()) {
                Some(code) => Ok(Dispatch {
                    code: Some(code.to_string()),
                    ..Dispatch::plain(ExecutionKind::Code)
                }),
                None => Ok(Dispatch::plain(ExecutionKind::Object)),
            }
        }
        ExecutionKind::Agent => {
            let agent_id = agent_id(request, record).ok_or_else(|| {
                ExecError::Config(format!(
                    "{} is dispatched to an agent but no agent id was given",
                    request.function_name
                ))
            })?;
            Ok(Dispatch {
                agent_id: Some(agent_id),
                ..Dispatch::plain(ExecutionKind::Agent)
            })
        }
        other => Ok(Dispatch::plain(other)),
    }
}

fn kind_from_shape(shape: Option<&Value>) -> ExecutionKind {
    match shape {
        Some(Value::Array(items)) if items.first().is_some_and(Value::is_string) => {
            ExecutionKind::TextArray
        }
        Some(Value::Array(_)) => ExecutionKind::ObjectArray,
        _ => ExecutionKind::Object,
    }
}

/// Args (`agent`, `agentId`), then settings, then the function record.
fn agent_id(request: &Request, record: Option<&FunctionRecord>) -> Option<String> {
    ["agent", "agentId"]
        .iter()
        .find_map(|key| request.args.get(*key).and_then(Value::as_str))
        .or(request.settings.agent_id.as_deref())
        .or_else(|| record.and_then(|r| r.agent_id.as_deref()))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
