//! Human-feedback requests.

use serde_json::json;

use crate::human::{FeedbackRequest, HumanChannel};
use crate::scheduler::Job;
use crate::types::{ExecutionKind, TaskRecord};

use super::{Deferred, Generation, Plan};

/// Open a feedback task and hand the wait to the scheduler. Returns the
/// pending envelope right away.
pub async fn request_feedback(
    human: Option<&dyn HumanChannel>,
    deferred: &Deferred<'_>,
    plan: &Plan<'_>,
) -> Generation {
    let Some(human) = human else {
        return Generation::failed("no human channel configured");
    };
    let hash = plan.hashes.request.as_str();
    let settings = &plan.request.settings;

    let feedback = FeedbackRequest {
        function: plan.request.function_name.clone(),
        hash: hash.to_string(),
        title: settings
            .title
            .clone()
            .unwrap_or_else(|| plan.request.function_name.clone()),
        prompt: settings
            .prompt
            .clone()
            .unwrap_or_else(|| plan.request.call_expression()),
        options: settings.options.clone().unwrap_or_default(),
        channel: settings.channel.clone(),
        args: plan.request.args.clone(),
    };

    let task_id = match human.create(&feedback).await {
        Ok(id) => id,
        Err(e) => {
            deferred.logger.warn("human", Some(hash), &format!("feedback task not created: {e}"));
            return Generation::failed(e.to_string());
        }
    };

    let pending = json!({"status": "in-progress", "taskId": task_id});
    let task = TaskRecord::pending(task_id.clone(), ExecutionKind::Human, hash);
    let action = plan.action(pending.clone(), None);

    // Written before the monitor is queued so its answer always lands last.
    if let Err(e) = deferred.store.put_task(task.clone()).await {
        deferred.logger.warn("human", Some(hash), &format!("task record not stored: {e}"));
    }
    if let Err(e) = deferred.store.put_action(action.clone()).await {
        deferred.logger.warn("human", Some(hash), &format!("pending action not stored: {e}"));
    }

    let job = Job::AwaitFeedback {
        task: task.clone(),
        action,
        timeout_ms: deferred.human_timeout_ms,
        callback: settings.callback.as_ref().map(|c| c.target()),
    };
    if let Err(e) = deferred.scheduler.try_submit(job) {
        deferred.logger.error("human", Some(hash), &format!("feedback monitor not scheduled: {e}"));
        let failure = json!({"error": e.to_string(), "taskId": task_id});
        super::abandon(deferred, task.fail(e.to_string()), plan.action(failure.clone(), None)).await;
        return Generation::new(failure, None).uncacheable();
    }

    Generation::new(pending, None)
}
