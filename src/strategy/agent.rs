//! Agent delegation.

use serde_json::json;

use crate::scheduler::Job;
use crate::types::{ExecutionKind, TaskRecord};

use super::{Deferred, Generation, Plan};

/// Queue a run of `agent_id` and return the pending envelope.
pub async fn delegate(deferred: &Deferred<'_>, plan: &Plan<'_>, agent_id: &str) -> Generation {
    let hash = plan.hashes.request.as_str();
    let task_id = uuid::Uuid::new_v4().to_string();
    let job_id = uuid::Uuid::new_v4().to_string();

    let mut task = TaskRecord::pending(task_id.clone(), ExecutionKind::Agent, hash);
    task.job_id = Some(job_id.clone());
    let pending = json!({"status": "in-progress", "taskId": task_id, "jobId": job_id});
    let action = plan.action(pending.clone(), None);

    if let Err(e) = deferred.store.put_task(task.clone()).await {
        deferred.logger.warn("agent", Some(hash), &format!("task record not stored: {e}"));
    }

    let job = Job::RunAgent {
        task: task.clone(),
        action: action.clone(),
        agent_id: agent_id.to_string(),
        prompt: plan.user_prompt(),
        context: json!({
            "function": plan.request.function_name,
            "args": plan.request.args,
            "shape": plan.request.shape,
        }),
        callback: plan.request.settings.callback.as_ref().map(|c| c.target()),
    };

    if let Err(e) = deferred.store.put_action(action.clone()).await {
        deferred.logger.warn("agent", Some(hash), &format!("pending action not stored: {e}"));
    }

    if let Err(e) = deferred.scheduler.try_submit(job) {
        deferred.logger.error("agent", Some(hash), &format!("agent {agent_id} not enqueued: {e}"));
        let failure = json!({"error": e.to_string()});
        super::abandon(deferred, task.fail(e.to_string()), plan.action(failure.clone(), None)).await;
        return Generation::new(failure, None).uncacheable();
    }

    Generation::new(pending, None)
}
