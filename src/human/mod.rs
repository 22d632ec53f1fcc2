//! Human-in-the-loop channel.
//!
//! A [`HumanChannel`] opens a feedback task somewhere a person will see it
//! and later resolves it with their answer. [`InboxChannel`] is an in-process
//! implementation: tasks sit in an inbox until [`InboxChannel::respond`] is
//! called.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::{ExecError, ExecResult};

/// What the person is asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub function: String,
    pub hash: String,
    pub title: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResponse {
    pub task_id: String,
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
}

#[async_trait]
pub trait HumanChannel: Send + Sync {
    /// Open a feedback task, returning its id.
    async fn create(&self, request: &FeedbackRequest) -> ExecResult<String>;

    /// Wait for the task to be answered.
    async fn wait(&self, task_id: &str, timeout: Duration) -> ExecResult<FeedbackResponse>;
}

struct InboxSlot {
    request: FeedbackRequest,
    tx: Option<oneshot::Sender<FeedbackResponse>>,
    rx: Option<oneshot::Receiver<FeedbackResponse>>,
}

/// In-process inbox of open feedback tasks.
#[derive(Default)]
pub struct InboxChannel {
    slots: DashMap<String, InboxSlot>,
}

impl InboxChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unanswered tasks, in no particular order.
    pub fn pending(&self) -> Vec<(String, FeedbackRequest)> {
        self.slots
            .iter()
            .filter(|s| s.tx.is_some())
            .map(|s| (s.key().clone(), s.request.clone()))
            .collect()
    }

    /// Answer a task. Fails if the task is unknown or already answered.
    pub fn respond(
        &self,
        task_id: &str,
        response: Value,
        responder: Option<String>,
    ) -> ExecResult<()> {
        let tx = self
            .slots
            .get_mut(task_id)
            .and_then(|mut slot| slot.tx.take())
            .ok_or_else(|| ExecError::Human(format!("No open task {task_id}")))?;
        tx.send(FeedbackResponse {
            task_id: task_id.to_string(),
            response,
            responder,
        })
        .map_err(|_| ExecError::Human(format!("Task {task_id} is no longer awaited")))
    }
}

#[async_trait]
impl HumanChannel for InboxChannel {
    async fn create(&self, request: &FeedbackRequest) -> ExecResult<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            task_id.clone(),
            InboxSlot {
                request: request.clone(),
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        Ok(task_id)
    }

    async fn wait(&self, task_id: &str, timeout: Duration) -> ExecResult<FeedbackResponse> {
        let rx = self
            .slots
            .get_mut(task_id)
            .and_then(|mut slot| slot.rx.take())
            .ok_or_else(|| ExecError::Human(format!("Task {task_id} is unknown or already awaited")))?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.slots.remove(task_id);
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ExecError::Human(format!("Task {task_id} was dropped"))),
            Err(_) => Err(ExecError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
