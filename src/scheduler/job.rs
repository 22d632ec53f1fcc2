use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::agent::AgentRunner;
use crate::error::{ExecError, ExecResult};
use crate::execlog::ExecLogger;
use crate::human::HumanChannel;
use crate::notify::Notifier;
use crate::store::RecordStore;
use crate::types::{
    ActionRecord, ArgumentRecord, DeliveryTarget, EventRecord, FunctionRecord, ShapeRecord,
    TaskRecord,
};

/// Background work scheduled off the request path.
#[derive(Debug, Clone)]
pub enum Job {
    /// Create-if-absent the canonical records and replace the action.
    PersistRecords {
        function: Option<FunctionRecord>,
        shape: Option<ShapeRecord>,
        arguments: Option<ArgumentRecord>,
        action: Option<ActionRecord>,
    },
    RecordEvent(EventRecord),
    Deliver {
        target: DeliveryTarget,
        payload: Value,
    },
    /// Wait for a human to answer, then supersede the pending action.
    AwaitFeedback {
        task: TaskRecord,
        action: ActionRecord,
        timeout_ms: u64,
        callback: Option<DeliveryTarget>,
    },
    /// Run a delegated agent, then supersede the pending action.
    RunAgent {
        task: TaskRecord,
        action: ActionRecord,
        agent_id: String,
        prompt: String,
        context: Value,
        callback: Option<DeliveryTarget>,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::PersistRecords { .. } => "persist_records",
            Job::RecordEvent(_) => "record_event",
            Job::Deliver { .. } => "deliver",
            Job::AwaitFeedback { .. } => "await_feedback",
            Job::RunAgent { .. } => "run_agent",
        }
    }

    /// Jobs that wait on a person or an agent rather than on storage.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Job::AwaitFeedback { .. } | Job::RunAgent { .. })
    }

    /// Request hash the job belongs to, for log correlation.
    pub fn hash(&self) -> Option<&str> {
        match self {
            Job::PersistRecords { action, .. } => action.as_ref().map(|a| a.hash.as_str()),
            Job::RecordEvent(event) => Some(&event.hash),
            Job::Deliver { .. } => None,
            Job::AwaitFeedback { task, .. } | Job::RunAgent { task, .. } => Some(&task.hash),
        }
    }
}

/// Retry schedule: `max_attempts` tries with a linearly growing pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

/// Collaborators jobs run against.
pub struct JobContext {
    pub store: Arc<dyn RecordStore>,
    pub logger: Arc<ExecLogger>,
    pub notifier: Arc<dyn Notifier>,
    pub human: Option<Arc<dyn HumanChannel>>,
    pub agents: Option<Arc<dyn AgentRunner>>,
    pub retry: RetryPolicy,
}

impl JobContext {
    /// Retry `op` in place. Used for follow-up writes that must not re-run the
    /// step that produced their input.
    async fn with_retries<F, Fut>(&self, what: &str, hash: Option<&str>, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExecResult<()>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            match op().await {
                Ok(()) => return true,
                Err(e) if attempt < attempts => {
                    tracing::warn!(what, attempt, error = %e, "retrying");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(e) => {
                    self.logger
                        .error("scheduler", hash, &format!("{what} failed after {attempts} attempts: {e}"));
                }
            }
        }
        false
    }

    async fn finish_task(
        &self,
        task: TaskRecord,
        action: ActionRecord,
        result: Value,
        reasoning: Option<String>,
        callback: Option<DeliveryTarget>,
    ) {
        let hash = task.hash.clone();
        let superseded = ActionRecord {
            result: result.clone(),
            reasoning,
            created_at: Utc::now(),
            ..action
        };
        let store = &self.store;
        self.with_retries("supersede action", Some(&hash), || {
            let record = superseded.clone();
            async move { store.put_action(record).await.map_err(ExecError::from) }
        })
        .await;

        let completed = task.complete(result.clone());
        let payload = json!({
            "taskId": completed.id,
            "status": "completed",
            "hash": hash,
            "result": result,
        });
        self.with_retries("complete task", Some(&hash), || {
            let record = completed.clone();
            async move { store.put_task(record).await.map_err(ExecError::from) }
        })
        .await;

        if let Some(target) = callback {
            let notifier = &self.notifier;
            self.with_retries("deliver callback", Some(&hash), || {
                notifier.deliver(&target, &payload)
            })
            .await;
        }
    }

    /// Fail the task and replace its pending action with an error envelope,
    /// which the cache never serves.
    async fn fail_task(
        &self,
        task: TaskRecord,
        action: ActionRecord,
        error: String,
        callback: Option<DeliveryTarget>,
    ) {
        let hash = task.hash.clone();
        self.logger.warn("scheduler", Some(&hash), &format!("task {} failed: {error}", task.id));
        let failed = task.fail(error.clone());
        let store = &self.store;
        let envelope = ActionRecord {
            result: json!({ "error": error, "taskId": failed.id }),
            reasoning: None,
            created_at: Utc::now(),
            ..action
        };
        self.with_retries("supersede action", Some(&hash), || {
            let record = envelope.clone();
            async move { store.put_action(record).await.map_err(ExecError::from) }
        })
        .await;
        let payload = json!({
            "taskId": failed.id,
            "status": "failed",
            "hash": hash,
            "error": error,
        });
        self.with_retries("fail task", Some(&hash), || {
            let record = failed.clone();
            async move { store.put_task(record).await.map_err(ExecError::from) }
        })
        .await;
        if let Some(target) = callback {
            let notifier = &self.notifier;
            self.with_retries("deliver callback", Some(&hash), || {
                notifier.deliver(&target, &payload)
            })
            .await;
        }
    }
}

impl Job {
    /// One attempt. An `Err` makes the worker retry the whole job.
    pub async fn run(&self, ctx: &JobContext) -> ExecResult<()> {
        match self {
            Job::PersistRecords {
                function,
                shape,
                arguments,
                action,
            } => {
                if let Some(record) = function {
                    ctx.store.create_function(record.clone()).await?;
                }
                if let Some(record) = shape {
                    ctx.store.create_shape(record.clone()).await?;
                }
                if let Some(record) = arguments {
                    ctx.store.create_arguments(record.clone()).await?;
                }
                if let Some(record) = action {
                    ctx.store.put_action(record.clone()).await?;
                }
                Ok(())
            }
            Job::RecordEvent(event) => Ok(ctx.store.append_event(event.clone()).await?),
            Job::Deliver { target, payload } => ctx.notifier.deliver(target, payload).await,
            Job::AwaitFeedback {
                task,
                action,
                timeout_ms,
                callback,
            } => {
                let Some(human) = &ctx.human else {
                    ctx.fail_task(
                        task.clone(),
                        action.clone(),
                        "no human channel configured".into(),
                        callback.clone(),
                    )
                        .await;
                    return Ok(());
                };
                // The answer can only be awaited once, so failures end the task
                // instead of retrying.
                match human.wait(&task.id, Duration::from_millis(*timeout_ms)).await {
                    Ok(answer) => {
                        ctx.finish_task(task.clone(), action.clone(), answer.response, None, callback.clone())
                            .await
                    }
                    Err(e) => {
                        ctx.fail_task(task.clone(), action.clone(), e.to_string(), callback.clone())
                            .await
                    }
                }
                Ok(())
            }
            Job::RunAgent {
                task,
                action,
                agent_id,
                prompt,
                context,
                callback,
            } => {
                let runner = ctx.agents.as_ref().ok_or_else(|| ExecError::Agent {
                    agent_id: agent_id.clone(),
                    message: "no agent runner configured".into(),
                })?;
                let reply = runner.run(agent_id, prompt, context).await?;
                ctx.finish_task(task.clone(), action.clone(), reply.output, reply.reasoning, callback.clone())
                    .await;
                Ok(())
            }
        }
    }

    /// Called once the last attempt failed.
    pub async fn exhausted(&self, ctx: &JobContext, error: &ExecError) {
        ctx.logger.error(
            "scheduler",
            self.hash(),
            &format!("{} dropped: {error}", self.name()),
        );
        if let Job::RunAgent {
            task,
            action,
            callback,
            ..
        } = self
        {
            ctx.fail_task(task.clone(), action.clone(), error.to_string(), callback.clone())
                .await;
        }
    }
}
