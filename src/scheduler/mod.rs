//! Telemetry and persistence scheduler.
//!
//! Everything the engine does after it has an answer (record writes, event
//! telemetry, callback delivery, human and agent follow-ups) becomes a
//! [`Job`] on a bounded queue drained by a fixed pool of workers. Failed jobs
//! are retried with linear backoff and then logged and dropped; nothing here
//! ever reaches the caller.
//!
//! Human and agent follow-ups can wait for hours. Workers hand those to a
//! tracked task set instead of running them, so the pool only ever blocks on
//! short writes and deliveries.

mod job;

pub use job::{Job, JobContext, RetryPolicy};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{ExecError, ExecResult};

pub struct Scheduler {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    deferred: Arc<Mutex<JoinSet<()>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Shared between the workers and the scheduler handle.
#[derive(Clone)]
struct Shared {
    ctx: Arc<JobContext>,
    deferred: Arc<Mutex<JoinSet<()>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Shared {
    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl Scheduler {
    /// Spawn `workers` workers on the current tokio runtime.
    pub fn start(context: JobContext, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Shared {
            ctx: Arc::new(context),
            deferred: Arc::new(Mutex::new(JoinSet::new())),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };

        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker(id, rx.clone(), shared.clone())))
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            deferred: shared.deferred,
            pending: shared.pending,
            idle: shared.idle,
        }
    }

    /// Enqueue without waiting. Fails when the queue is full or shut down.
    pub fn try_submit(&self, job: Job) -> ExecResult<()> {
        let sender = self
            .tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or_else(|| ExecError::Queue("scheduler is shut down".into()))?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.release();
                match e {
                    mpsc::error::TrySendError::Full(job) => {
                        Err(ExecError::Queue(format!("queue full, dropped {}", job.name())))
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        Err(ExecError::Queue("scheduler is shut down".into()))
                    }
                }
            }
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolves once every submitted job has finished (or been dropped).
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Human and agent follow-ups currently running off the worker pool.
    pub fn deferred_running(&self) -> usize {
        let mut set = lock(&self.deferred);
        while set.try_join_next().is_some() {}
        set.len()
    }

    /// Stop accepting jobs, drain the queue, and wait for the workers and
    /// every deferred follow-up they handed off.
    pub async fn shutdown(&self) {
        let sender = self.tx.lock().ok().and_then(|mut tx| tx.take());
        drop(sender);
        let handles: Vec<_> = self
            .workers
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
        let mut deferred = std::mem::take(&mut *lock(&self.deferred));
        while deferred.join_next().await.is_some() {}
    }

    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn worker(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    shared: Shared,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            tracing::debug!(worker = id, "queue closed, worker exiting");
            break;
        };

        if job.is_long_running() {
            let task = shared.clone();
            let mut set = lock(&shared.deferred);
            while set.try_join_next().is_some() {}
            set.spawn(async move {
                run_with_retries(&task.ctx, &job).await;
                task.release();
            });
            continue;
        }

        run_with_retries(&shared.ctx, &job).await;
        shared.release();
    }
}

async fn run_with_retries(ctx: &JobContext, job: &Job) {
    let attempts = ctx.retry.max_attempts.max(1);
    for attempt in 1..=attempts {
        match job.run(ctx).await {
            Ok(()) => return,
            Err(e) if attempt < attempts => {
                tracing::warn!(job = job.name(), attempt, error = %e, "job failed, retrying");
                tokio::time::sleep(ctx.retry.delay(attempt)).await;
            }
            Err(e) => job.exhausted(ctx, &e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentReply, AgentRunner};
    use crate::execlog::{ExecLogger, MemorySink};
    use crate::human::{FeedbackRequest, HumanChannel, InboxChannel};
    use crate::notify::{NoopNotifier, Notifier};
    use crate::store::{MemoryStore, RecordStore};
    use crate::types::*;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Notifier that fails the first `failures` deliveries.
    struct FlakyNotifier {
        failures: AtomicU32,
        delivered: Mutex<Vec<(String, Value)>>,
    }

    impl FlakyNotifier {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn delivered(&self) -> Vec<(String, Value)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn deliver(&self, target: &DeliveryTarget, payload: &Value) -> ExecResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ExecError::Delivery("503".into()));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((target.url.clone(), payload.clone()));
            Ok(())
        }
    }

    struct EchoAgent;

    #[async_trait]
    impl AgentRunner for EchoAgent {
        async fn run(&self, agent_id: &str, prompt: &str, _context: &Value) -> ExecResult<AgentReply> {
            if agent_id == "broken" {
                return Err(ExecError::Agent {
                    agent_id: agent_id.into(),
                    message: "crashed".into(),
                });
            }
            Ok(AgentReply {
                output: json!({"agent": agent_id, "echo": prompt}),
                reasoning: Some("echoed".into()),
            })
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        notifier: Arc<FlakyNotifier>,
        inbox: Arc<InboxChannel>,
        scheduler: Scheduler,
    }

    fn harness(notifier_failures: u32) -> Harness {
        harness_with(notifier_failures, 2)
    }

    fn harness_with(notifier_failures: u32, workers: usize) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let notifier = Arc::new(FlakyNotifier::new(notifier_failures));
        let inbox = Arc::new(InboxChannel::new());
        let ctx = JobContext {
            store: store.clone(),
            logger: Arc::new(ExecLogger::new().with_sink(sink.clone())),
            notifier: notifier.clone(),
            human: Some(inbox.clone()),
            agents: Some(Arc::new(EchoAgent)),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
            },
        };
        Harness {
            store,
            sink,
            notifier,
            inbox,
            scheduler: Scheduler::start(ctx, workers, 16),
        }
    }

    fn pending_action(hash: &str, kind: ExecutionKind) -> ActionRecord {
        ActionRecord {
            hash: hash.into(),
            function: "f".into(),
            arguments_hash: "args".into(),
            shape_hash: None,
            kind,
            result: json!({"status": "in-progress"}),
            reasoning: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn persist_records_is_idempotent() {
        let h = harness(0);
        let job = Job::PersistRecords {
            function: Some(FunctionRecord::new("f", ExecutionKind::Object)),
            shape: None,
            arguments: Some(ArgumentRecord {
                hash: "args".into(),
                args: Map::new(),
                created_at: chrono::Utc::now(),
            }),
            action: Some(pending_action("h1", ExecutionKind::Object)),
        };
        h.scheduler.try_submit(job.clone()).unwrap();
        h.scheduler.try_submit(job).unwrap();
        h.scheduler.wait_idle().await;

        assert_eq!(h.store.function_count(), 1);
        assert_eq!(h.store.argument_count(), 1);
        assert_eq!(h.store.action_count(), 1);
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn events_are_appended() {
        let h = harness(0);
        let request = Request::new("f");
        h.scheduler
            .try_submit(Job::RecordEvent(EventRecord::new("h1", &request)))
            .unwrap();
        h.scheduler.wait_idle().await;
        assert_eq!(h.store.events().len(), 1);
    }

    #[tokio::test]
    async fn open_human_wait_does_not_hold_a_worker() {
        let h = harness_with(0, 1);
        let feedback = FeedbackRequest {
            function: "f".into(),
            hash: "h9".into(),
            title: "t".into(),
            prompt: "p".into(),
            options: vec![],
            channel: None,
            args: Map::new(),
        };
        let task_id = h.inbox.create(&feedback).await.unwrap();
        h.scheduler
            .try_submit(Job::AwaitFeedback {
                task: TaskRecord::pending(task_id.clone(), ExecutionKind::Human, "h9"),
                action: pending_action("h9", ExecutionKind::Human),
                timeout_ms: 60_000,
                callback: None,
            })
            .unwrap();
        h.scheduler
            .try_submit(Job::RecordEvent(EventRecord::new("h10", &Request::new("g"))))
            .unwrap();

        let written = tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.events().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(written.is_ok(), "event write waited behind the human task");
        assert_eq!(h.scheduler.deferred_running(), 1);

        h.inbox.respond(&task_id, json!("ok"), None).unwrap();
        h.scheduler.wait_idle().await;
        assert_eq!(h.scheduler.deferred_running(), 0);
        let task = h.store.task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_waits_for_deferred_work() {
        let h = harness_with(0, 1);
        h.scheduler
            .try_submit(Job::RunAgent {
                task: TaskRecord::pending("t9", ExecutionKind::Agent, "h11"),
                action: pending_action("h11", ExecutionKind::Agent),
                agent_id: "researcher".into(),
                prompt: "go".into(),
                context: Value::Null,
                callback: None,
            })
            .unwrap();
        h.scheduler.shutdown().await;
        let task = h.store.task("t9").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn delivery_retries_then_succeeds() {
        let h = harness(2);
        h.scheduler
            .try_submit(Job::Deliver {
                target: DeliveryTarget::new("https://hooks.example/x"),
                payload: json!({"ok": true}),
            })
            .unwrap();
        h.scheduler.wait_idle().await;
        assert_eq!(h.notifier.delivered().len(), 1);
        assert!(h.sink.matching("dropped").is_empty());
    }

    #[tokio::test]
    async fn delivery_gives_up_and_logs() {
        let h = harness(10);
        h.scheduler
            .try_submit(Job::Deliver {
                target: DeliveryTarget::new("https://hooks.example/x"),
                payload: json!({}),
            })
            .unwrap();
        h.scheduler.wait_idle().await;
        assert!(h.notifier.delivered().is_empty());
        assert_eq!(h.sink.matching("deliver dropped").len(), 1);
    }

    #[tokio::test]
    async fn human_answer_supersedes_action_and_completes_task() {
        let h = harness(0);
        let feedback = FeedbackRequest {
            function: "f".into(),
            hash: "h1".into(),
            title: "t".into(),
            prompt: "p".into(),
            options: vec![],
            channel: None,
            args: Map::new(),
        };
        let task_id = h.inbox.create(&feedback).await.unwrap();
        let task = TaskRecord::pending(task_id.clone(), ExecutionKind::Human, "h1");
        let action = pending_action("h1", ExecutionKind::Human);
        h.store.put_action(action.clone()).await.unwrap();
        h.store.put_task(task.clone()).await.unwrap();

        h.scheduler
            .try_submit(Job::AwaitFeedback {
                task,
                action,
                timeout_ms: 5_000,
                callback: Some(DeliveryTarget::new("https://hooks.example/done")),
            })
            .unwrap();
        h.inbox.respond(&task_id, json!("approved"), None).unwrap();
        h.scheduler.wait_idle().await;

        let stored = h.store.action("h1").await.unwrap().unwrap();
        assert_eq!(stored.result, json!("approved"));
        let task = h.store.task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!("approved")));
        let delivered = h.notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["status"], "completed");
        assert_eq!(delivered[0].1["taskId"], json!(task_id));
    }

    #[tokio::test]
    async fn human_timeout_fails_task() {
        let h = harness(0);
        let feedback = FeedbackRequest {
            function: "f".into(),
            hash: "h2".into(),
            title: "t".into(),
            prompt: "p".into(),
            options: vec![],
            channel: None,
            args: Map::new(),
        };
        let task_id = h.inbox.create(&feedback).await.unwrap();
        h.scheduler
            .try_submit(Job::AwaitFeedback {
                task: TaskRecord::pending(task_id.clone(), ExecutionKind::Human, "h2"),
                action: pending_action("h2", ExecutionKind::Human),
                timeout_ms: 10,
                callback: None,
            })
            .unwrap();
        h.scheduler.wait_idle().await;

        let task = h.store.task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("timed out"));
        let action = h.store.action("h2").await.unwrap().unwrap();
        assert!(action.result.get("error").is_some());
    }

    #[tokio::test]
    async fn agent_job_completes_task() {
        let h = harness(0);
        let task = TaskRecord::pending("t1", ExecutionKind::Agent, "h3");
        h.scheduler
            .try_submit(Job::RunAgent {
                task,
                action: pending_action("h3", ExecutionKind::Agent),
                agent_id: "researcher".into(),
                prompt: "summarize".into(),
                context: Value::Null,
                callback: None,
            })
            .unwrap();
        h.scheduler.wait_idle().await;

        let action = h.store.action("h3").await.unwrap().unwrap();
        assert_eq!(action.result["echo"], "summarize");
        assert_eq!(action.reasoning.as_deref(), Some("echoed"));
        let task = h.store.task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn agent_failure_exhausts_and_fails_task() {
        let h = harness(0);
        h.scheduler
            .try_submit(Job::RunAgent {
                task: TaskRecord::pending("t2", ExecutionKind::Agent, "h4"),
                action: pending_action("h4", ExecutionKind::Agent),
                agent_id: "broken".into(),
                prompt: "go".into(),
                context: Value::Null,
                callback: Some(DeliveryTarget::new("https://hooks.example/fail")),
            })
            .unwrap();
        h.scheduler.wait_idle().await;

        let task = h.store.task("t2").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let action = h.store.action("h4").await.unwrap().unwrap();
        assert_eq!(action.result["taskId"], "t2");
        assert!(action.result["error"].is_string());
        assert_eq!(h.notifier.delivered()[0].1["status"], "failed");
        assert_eq!(h.sink.matching("run_agent dropped").len(), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let store = Arc::new(MemoryStore::new());
        let ctx = JobContext {
            store,
            logger: Arc::new(ExecLogger::new()),
            notifier: Arc::new(NoopNotifier),
            human: None,
            agents: None,
            retry: RetryPolicy::default(),
        };
        // Nothing yields between these submits, so the worker cannot drain.
        let scheduler = Scheduler::start(ctx, 1, 1);
        let hold = || Job::RecordEvent(EventRecord::new("h", &Request::new("f")));
        let mut rejected = 0;
        for _ in 0..50 {
            if let Err(e) = scheduler.try_submit(hold()) {
                assert!(matches!(e, ExecError::Queue(_)));
                rejected += 1;
            }
        }
        assert!(rejected > 0);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_then_rejects() {
        let h = harness(0);
        for i in 0..5 {
            let request = Request::new(format!("f{i}"));
            h.scheduler
                .try_submit(Job::RecordEvent(EventRecord::new("h", &request)))
                .unwrap();
        }
        h.scheduler.shutdown().await;
        assert_eq!(h.store.events().len(), 5);
        let request = Request::new("late");
        assert!(h
            .scheduler
            .try_submit(Job::RecordEvent(EventRecord::new("h", &request)))
            .is_err());
    }

    #[test]
    fn linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 50,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
    }
}
