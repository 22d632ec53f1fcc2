//! The execution engine.
//!
//! One call walks hash → four concurrent lookups → cache decision. A hit
//! returns the stored result. A miss is classified, generated by the
//! matching strategy, validated against the shape, and handed back while
//! the record writes and telemetry go to the scheduler.

mod builder;

pub use builder::EngineBuilder;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::cache::{CachePolicy, InflightLeases, Lease, Lookups};
use crate::config::EngineConfig;
use crate::dispatch::{classify, labelled_kind, Dispatch};
use crate::error::{ExecError, ExecResult};
use crate::execlog::ExecLogger;
use crate::hash::RequestHashes;
use crate::human::HumanChannel;
use crate::provider::Provider;
use crate::sandbox::{CodeSandbox, SandboxLimits};
use crate::scheduler::{Job, Scheduler};
use crate::schema::{self, Shape};
use crate::store::RecordStore;
use crate::strategy::{
    self, agent, code, human, is_error_result, object, text, Deferred, Generation,
    GenerationStream, Plan,
};
use crate::telemetry::Stopwatch;
use crate::types::{
    ActionRecord, ArgumentRecord, EventRecord, Execution, ExecutionKind, FunctionRecord, Request, ShapeRecord,
    TaskRecord,
};

/// What [`Engine::run`] produced, chosen by `settings.stream`.
pub enum Outcome {
    Complete(Execution),
    Stream(GenerationStream),
}

pub struct Engine {
    config: EngineConfig,
    policy: CachePolicy,
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn Provider>,
    sandbox: Arc<dyn CodeSandbox>,
    human: Option<Arc<dyn HumanChannel>>,
    logger: Arc<ExecLogger>,
    scheduler: Arc<Scheduler>,
    leases: InflightLeases<Generation>,
}

/// A request that missed the cache.
struct Miss {
    hashes: RequestHashes,
    lookups: Lookups,
    dispatch: Dispatch,
    shape: Option<Shape>,
    watch: Stopwatch,
}

enum Resolution {
    Hit(Execution),
    Miss(Miss),
}

/// Canonical records the store does not have yet.
type NewRecords = (Option<FunctionRecord>, Option<ShapeRecord>, Option<ArgumentRecord>);

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn logger(&self) -> &ExecLogger {
        &self.logger
    }

    /// Execute a request and return its complete output.
    pub async fn execute(&self, request: Request) -> ExecResult<Execution> {
        match self.resolve(&request).await? {
            Resolution::Hit(execution) => Ok(execution),
            Resolution::Miss(miss) => Ok(self.complete_miss(&request, miss).await),
        }
    }

    /// Execute a request as a stream of text fragments. Cache hits and kinds
    /// that cannot stream (code, human, agent) yield one fragment.
    pub async fn execute_stream(&self, request: Request) -> ExecResult<GenerationStream> {
        match self.resolve(&request).await? {
            Resolution::Hit(execution) => Ok(GenerationStream::once(
                execution.generation_hash,
                &execution.output,
                true,
            )),
            Resolution::Miss(miss) if streams(miss.dispatch.kind) => {
                Ok(self.stream_miss(request, miss))
            }
            Resolution::Miss(miss) => {
                let execution = self.complete_miss(&request, miss).await;
                Ok(GenerationStream::once(
                    execution.generation_hash,
                    &execution.output,
                    false,
                ))
            }
        }
    }

    pub async fn run(&self, request: Request) -> ExecResult<Outcome> {
        if request.settings.stream {
            Ok(Outcome::Stream(self.execute_stream(request).await?))
        } else {
            Ok(Outcome::Complete(self.execute(request).await?))
        }
    }

    /// Tracking record of a human or agent execution.
    pub async fn task(&self, task_id: &str) -> ExecResult<Option<TaskRecord>> {
        Ok(self.store.task(task_id).await?)
    }

    /// Resolves once all scheduled background work has finished.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Drain background work and stop the workers.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    // ─── Cache ──────────────────────────────────────────────────────────────

    async fn resolve(&self, request: &Request) -> ExecResult<Resolution> {
        if request.function_name.trim().is_empty() {
            return Err(ExecError::Config("function name is empty".into()));
        }

        let mut watch = Stopwatch::start();
        let hashes = RequestHashes::compute(request);
        watch.hashed();
        let lookups = Lookups::gather(self.store.as_ref(), &request.function_name, &hashes).await;
        watch.looked_up();

        let hash = hashes.request.as_str();
        for (kind, error) in &lookups.errors {
            self.logger.warn(
                "cache",
                Some(hash),
                &format!("{kind} lookup failed, treating as miss: {error}"),
            );
        }

        let ttl = self.policy.ttl_for(&request.settings);
        let fresh = lookups
            .fresh_action(ttl)
            .filter(|action| !is_error_result(action.kind, &action.result));
        if let Some(action) = fresh {
            self.logger.debug("cache", Some(hash), "hit");
            let execution = Execution {
                output: action.result.clone(),
                reasoning: action.reasoning.clone(),
                generation_hash: hashes.request.clone(),
                cached: true,
                kind: Some(action.kind),
                latencies: watch.finish(),
            };
            self.schedule_followups(request, &execution);
            return Ok(Resolution::Hit(execution));
        }
        self.logger.debug("cache", Some(hash), "miss");

        let dispatch = classify(request, lookups.function.as_ref())?;
        let shape = request.shape.as_ref().map(Shape::parse);
        Ok(Resolution::Miss(Miss {
            hashes,
            lookups,
            dispatch,
            shape,
            watch,
        }))
    }

    // ─── Generation ─────────────────────────────────────────────────────────

    async fn complete_miss(&self, request: &Request, miss: Miss) -> Execution {
        let Miss {
            hashes,
            lookups,
            dispatch,
            shape,
            mut watch,
        } = miss;
        let plan = self.plan(request, &hashes, &dispatch, shape.as_ref());
        let (generation, leader) = self.generate_once(&plan).await;
        watch.generated();

        let hash = hashes.request.as_str();
        if let Some(error) = generation.output.get("_error") {
            self.logger
                .warn("generate", Some(hash), &format!("{} generation failed: {error}", dispatch.kind));
        }

        // Followers share the leader's generation and its writes.
        if leader {
            let (function, shape_record, arguments) =
                new_records(request, &hashes, &lookups, shape.as_ref());
            let action = (generation.cacheable && !dispatch.kind.is_deferred())
                .then(|| plan.action(generation.output.clone(), generation.reasoning.clone()));
            submit(
                &self.scheduler,
                &self.logger,
                hash,
                persist_job(function, shape_record, arguments, action),
            );
        }

        let execution = Execution {
            output: generation.output,
            reasoning: generation.reasoning,
            generation_hash: hashes.request.clone(),
            cached: false,
            kind: Some(dispatch.kind),
            latencies: watch.finish(),
        };
        self.schedule_followups(request, &execution);
        execution
    }

    /// Generate, sharing an in-flight generation for the same hash when
    /// coalescing is enabled. The flag is `false` for followers.
    async fn generate_once(&self, plan: &Plan<'_>) -> (Generation, bool) {
        if !self.config.coalesce_inflight {
            return (self.generate_validated(plan).await, true);
        }
        match self.leases.acquire(&plan.hashes.request) {
            Lease::Leader(guard) => {
                let generation = self.generate_validated(plan).await;
                guard.publish(generation.clone());
                (generation, true)
            }
            Lease::Follower(rx) => {
                let wait = Duration::from_millis(plan.timeout_ms.saturating_add(1_000));
                match InflightLeases::follow(rx, wait).await {
                    Some(generation) => {
                        self.logger
                            .debug("cache", Some(&plan.hashes.request), "joined in-flight generation");
                        (generation, false)
                    }
                    None => (self.generate_validated(plan).await, true),
                }
            }
        }
    }

    async fn generate_validated(&self, plan: &Plan<'_>) -> Generation {
        let generation = self.generate(plan).await;
        let Some(shape) = plan.shape.filter(|_| generation.cacheable) else {
            return generation;
        };

        let Generation {
            output, reasoning, ..
        } = generation;
        let output = match plan.kind() {
            ExecutionKind::Object | ExecutionKind::Code => schema::validate(shape, output),
            ExecutionKind::ObjectArray => match output {
                Value::Array(items) => {
                    Value::Array(schema::validate_items(object::item_shape(shape), items))
                }
                other => other,
            },
            _ => return Generation::new(output, reasoning),
        };
        let valid = !carries_validation_error(&output);
        Generation {
            output,
            reasoning,
            cacheable: valid,
        }
    }

    /// One handler per kind.
    async fn generate(&self, plan: &Plan<'_>) -> Generation {
        let provider = self.provider.as_ref();
        match plan.kind() {
            ExecutionKind::Object => object::generate_object(provider, plan).await,
            ExecutionKind::ObjectArray => object::generate_object_array(provider, plan).await,
            ExecutionKind::Text => text::generate_text(provider, plan).await,
            ExecutionKind::TextArray => text::generate_text_array(provider, plan).await,
            ExecutionKind::Code => {
                code::run_code(self.sandbox.as_ref(), plan, self.sandbox_limits(plan)).await
            }
            ExecutionKind::Human => {
                human::request_feedback(self.human.as_deref(), &self.deferred(), plan).await
            }
            ExecutionKind::Agent => match plan.dispatch.agent_id.as_deref() {
                Some(agent_id) => agent::delegate(&self.deferred(), plan, agent_id).await,
                None => Generation::failed("no agent id"),
            },
        }
    }

    fn stream_miss(&self, request: Request, miss: Miss) -> GenerationStream {
        let Miss {
            hashes,
            lookups,
            dispatch,
            shape,
            watch,
        } = miss;
        let plan = self.plan(&request, &hashes, &dispatch, shape.as_ref());
        let (system, user) = strategy::stream_prompt(&plan);
        let completion_request = plan.completion_request(system, user);
        let timeout_ms = plan.timeout_ms;
        let template = plan.action(Value::Null, None);
        let records = new_records(&request, &hashes, &lookups, shape.as_ref());
        let kind = dispatch.kind;
        let hash = hashes.request.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let provider = self.provider.clone();
        let scheduler = self.scheduler.clone();
        let logger = self.logger.clone();
        let stream_hash = hash.clone();

        tokio::spawn(async move {
            let mut watch = watch;
            let streamed = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                provider.stream(&completion_request, tx.clone()),
            )
            .await;
            watch.generated();

            let (output, reasoning) = match streamed {
                Ok(Ok(completion)) => (assemble(kind, &completion.text), completion.reasoning),
                Ok(Err(e)) => (json!({ "_error": e.to_string() }), None),
                Err(_) => (json!({ "_error": ExecError::Timeout { timeout_ms }.to_string() }), None),
            };

            let cacheable = !is_error_result(kind, &output);
            if !cacheable {
                logger.warn("generate", Some(&hash), &format!("{kind} stream failed: {output}"));
            }
            let action = cacheable.then(|| ActionRecord {
                result: output.clone(),
                reasoning: reasoning.clone(),
                created_at: Utc::now(),
                ..template
            });
            let (function, shape_record, arguments) = records;
            submit(
                &scheduler,
                &logger,
                &hash,
                persist_job(function, shape_record, arguments, action),
            );

            let execution = Execution {
                output,
                reasoning,
                generation_hash: hash.clone(),
                cached: false,
                kind: Some(kind),
                latencies: watch.finish(),
            };
            submit(&scheduler, &logger, &hash, Some(event_job(&request, &execution)));
            submit(&scheduler, &logger, &hash, delivery_job(&request, &execution));

            // The stream ends only once everything above is queued.
            drop(tx);
        });

        GenerationStream::new(rx, stream_hash)
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn plan<'a>(
        &self,
        request: &'a Request,
        hashes: &'a RequestHashes,
        dispatch: &'a Dispatch,
        shape: Option<&'a Shape>,
    ) -> Plan<'a> {
        let settings = &request.settings;
        Plan {
            request,
            hashes,
            dispatch,
            shape,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            temperature: settings.temperature.unwrap_or(self.config.default_temperature),
            max_tokens: settings.max_tokens.unwrap_or(self.config.default_max_tokens),
            timeout_ms: settings.timeout.unwrap_or(self.config.default_timeout_ms),
        }
    }

    fn sandbox_limits(&self, plan: &Plan<'_>) -> SandboxLimits {
        SandboxLimits {
            timeout_ms: plan.timeout_ms,
            memory_limit_mb: plan
                .request
                .settings
                .memory_limit_mb
                .unwrap_or(self.config.sandbox_memory_limit_mb),
        }
    }

    fn deferred(&self) -> Deferred<'_> {
        Deferred {
            store: self.store.as_ref(),
            scheduler: &self.scheduler,
            logger: &self.logger,
            human_timeout_ms: self.config.human_timeout_ms,
        }
    }

    /// Event telemetry and, when the request asked for it, delivery of the
    /// result. Runs for hits and misses alike.
    fn schedule_followups(&self, request: &Request, execution: &Execution) {
        let hash = execution.generation_hash.as_str();
        submit(&self.scheduler, &self.logger, hash, Some(event_job(request, execution)));
        submit(&self.scheduler, &self.logger, hash, delivery_job(request, execution));
    }
}

fn streams(kind: ExecutionKind) -> bool {
    matches!(
        kind,
        ExecutionKind::Object | ExecutionKind::ObjectArray | ExecutionKind::Text | ExecutionKind::TextArray
    )
}

/// Turn streamed text into the output its kind would have produced.
fn assemble(kind: ExecutionKind, text: &str) -> Value {
    match kind {
        ExecutionKind::Object => object::parse_object(text),
        ExecutionKind::ObjectArray => match object::parse_array(text) {
            Some(items) => Value::Array(items),
            None => json!({
                "_error": "model output is not a JSON array",
                "raw_response": text,
            }),
        },
        ExecutionKind::TextArray => Value::Array(
            text::parse_list(text).into_iter().map(Value::String).collect(),
        ),
        _ => Value::String(text.to_string()),
    }
}

fn carries_validation_error(output: &Value) -> bool {
    match output {
        Value::Array(items) => items.iter().any(schema::has_validation_error),
        other => schema::has_validation_error(other),
    }
}

fn new_records(
    request: &Request,
    hashes: &RequestHashes,
    lookups: &Lookups,
    shape: Option<&Shape>,
) -> NewRecords {
    let now = Utc::now();
    // Only an explicit label is remembered. A kind inferred from this call's
    // shape must not decide later calls with other shapes.
    let function = lookups.function.is_none().then(|| {
        let kind = labelled_kind(request).unwrap_or(ExecutionKind::Object);
        let record = FunctionRecord::new(request.function_name.clone(), kind);
        match &request.shape {
            Some(shape) => record.with_shape(shape.clone()),
            None => record,
        }
    });
    let shape_record = match (&hashes.shape, &request.shape, shape) {
        (Some(hash), Some(raw), Some(parsed)) if lookups.shape.is_none() => Some(ShapeRecord {
            hash: hash.clone(),
            shape: raw.clone(),
            schema: parsed.to_json_schema(),
            created_at: now,
        }),
        _ => None,
    };
    let arguments = lookups.arguments.is_none().then(|| ArgumentRecord {
        hash: hashes.args.clone(),
        args: request.args.clone(),
        created_at: now,
    });
    (function, shape_record, arguments)
}

fn persist_job(
    function: Option<FunctionRecord>,
    shape: Option<ShapeRecord>,
    arguments: Option<ArgumentRecord>,
    action: Option<ActionRecord>,
) -> Option<Job> {
    if function.is_none() && shape.is_none() && arguments.is_none() && action.is_none() {
        return None;
    }
    Some(Job::PersistRecords {
        function,
        shape,
        arguments,
        action,
    })
}

fn event_job(request: &Request, execution: &Execution) -> Job {
    let mut event = EventRecord::new(execution.generation_hash.clone(), request);
    event.kind = execution.kind;
    event.cached = execution.cached;
    event.output = execution.output.clone();
    event.reasoning = execution.reasoning.clone();
    event.latencies = execution.latencies;
    Job::RecordEvent(event)
}

/// Callback delivery for a synchronous kind. Human and agent results reach
/// the callback from their follow-up job once they exist.
fn delivery_job(request: &Request, execution: &Execution) -> Option<Job> {
    let callback = request.settings.callback.as_ref()?;
    let kind = execution.kind?;
    if kind.is_deferred() {
        return None;
    }
    let status = if is_error_result(kind, &execution.output) {
        "failed"
    } else {
        "completed"
    };
    Some(Job::Deliver {
        target: callback.target(),
        payload: json!({
            "hash": execution.generation_hash,
            "function": request.function_name,
            "status": status,
            "cached": execution.cached,
            "result": execution.output,
            "reasoning": execution.reasoning,
        }),
    })
}

fn submit(scheduler: &Scheduler, logger: &ExecLogger, hash: &str, job: Option<Job>) {
    let Some(job) = job else {
        return;
    };
    let name = job.name();
    if let Err(e) = scheduler.try_submit(job) {
        logger.warn("scheduler", Some(hash), &format!("{name} not queued: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execlog::MemorySink;
    use crate::human::InboxChannel;
    use crate::notify::Notifier;
    use crate::types::{Callback, DeliveryTarget};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use crate::provider::mock::{MockProvider, Reply};
    use crate::sandbox::MockSandbox;
    use crate::store::{MemoryStore, RecordStore};
    use crate::types::Settings;

    struct Harness {
        engine: Engine,
        store: Arc<MemoryStore>,
        provider: Arc<MockProvider>,
    }

    fn harness(provider: MockProvider, config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let engine = Engine::builder()
            .with_config(config.with_retry_backoff_ms(1))
            .with_store(store.clone())
            .with_provider(provider.clone())
            .with_logger(Arc::new(ExecLogger::new()))
            .build()
            .unwrap();
        Harness {
            engine,
            store,
            provider,
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        delivered: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingNotifier {
        fn delivered(&self) -> Vec<(String, Value)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, target: &DeliveryTarget, payload: &Value) -> ExecResult<()> {
            self.delivered
                .lock()
                .unwrap()
                .push((target.url.clone(), payload.clone()));
            Ok(())
        }
    }

    fn with_callback(request: Request, url: &str) -> Request {
        let settings = Settings {
            callback: Some(Callback::Url(url.into())),
            ..request.settings.clone()
        };
        request.with_settings(settings)
    }

    fn categorize() -> Request {
        Request::new("categorizeProduct")
            .with_args(json!({ "name": "Trail shoe", "price": 120 }))
            .with_shape(json!({ "category": "string", "confidence": "number" }))
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let h = harness(
            MockProvider::new(r#"{"category":"footwear","confidence":0.9}"#),
            EngineConfig::default(),
        );

        let first = h.engine.execute(categorize()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.kind, Some(ExecutionKind::Object));
        assert_eq!(first.output["category"], "footwear");
        h.engine.wait_idle().await;

        let second = h.engine.execute(categorize()).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.output, first.output);
        assert_eq!(second.generation_hash, first.generation_hash);
        assert_eq!(second.latencies.generation_ms, 0.0);
        assert_eq!(h.provider.calls(), 1);

        h.engine.wait_idle().await;
        assert_eq!(h.store.function_count(), 1);
        assert_eq!(h.store.argument_count(), 1);
        assert_eq!(h.store.shape_count(), 1);
        assert_eq!(h.store.action_count(), 1);
        let events = h.store.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events.iter().filter(|e| e.cached).count(), 1);
    }

    #[tokio::test]
    async fn callback_receives_generated_and_cached_results() {
        let notifier = Arc::new(RecordingNotifier::default());
        let provider = Arc::new(MockProvider::new("hello"));
        let engine = Engine::builder()
            .with_config(EngineConfig::default().with_retry_backoff_ms(1))
            .with_store(Arc::new(MemoryStore::new()))
            .with_provider(provider.clone())
            .with_notifier(notifier.clone())
            .build()
            .unwrap();
        let request = with_callback(
            Request::new("greet").with_kind("text"),
            "https://hooks.example/greet",
        );

        let first = engine.execute(request.clone()).await.unwrap();
        engine.wait_idle().await;
        let again = engine.execute(request).await.unwrap();
        engine.wait_idle().await;
        assert!(again.cached);

        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].0, "https://hooks.example/greet");
        assert_eq!(delivered[0].1["result"], "hello");
        assert_eq!(delivered[0].1["status"], "completed");
        assert_eq!(delivered[0].1["hash"], json!(first.generation_hash));
        assert_eq!(delivered[0].1["cached"], false);
        assert_eq!(delivered[1].1["cached"], true);
    }

    #[tokio::test]
    async fn callback_reports_failed_generation() {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::builder()
            .with_config(EngineConfig::default().with_retry_backoff_ms(1))
            .with_store(Arc::new(MemoryStore::new()))
            .with_provider(Arc::new(MockProvider::new("x").then(Reply::Fail("down".into()))))
            .with_notifier(notifier.clone())
            .build()
            .unwrap();
        let request = with_callback(categorize(), "https://hooks.example/cat");

        engine.execute(request).await.unwrap();
        engine.wait_idle().await;
        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["status"], "failed");
    }

    #[tokio::test]
    async fn streamed_result_is_delivered() {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::builder()
            .with_config(EngineConfig::default().with_retry_backoff_ms(1))
            .with_store(Arc::new(MemoryStore::new()))
            .with_provider(Arc::new(MockProvider::new("streamed words")))
            .with_notifier(notifier.clone())
            .build()
            .unwrap();
        let request = with_callback(Request::new("story").with_kind("text"), "https://hooks.example/s");

        let stream = engine.execute_stream(request).await.unwrap();
        stream.collect().await;
        engine.wait_idle().await;
        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["result"], "streamed words");
    }

    #[tokio::test]
    async fn inferred_kind_does_not_stick_to_the_function() {
        let h = harness(
            MockProvider::new(r#"{"title":"Dune"}"#).then(Reply::Text("1. a\n2. b".into())),
            EngineConfig::default(),
        );

        let list = h
            .engine
            .execute(Request::new("f").with_shape(json!(["string"])))
            .await
            .unwrap();
        assert_eq!(list.kind, Some(ExecutionKind::TextArray));
        assert_eq!(list.output, json!(["a", "b"]));
        h.engine.wait_idle().await;
        let record = h.store.function("f").await.unwrap().unwrap();
        assert_eq!(record.kind, ExecutionKind::Object);

        let object = h
            .engine
            .execute(Request::new("f").with_shape(json!({ "title": "string" })))
            .await
            .unwrap();
        assert_eq!(object.kind, Some(ExecutionKind::Object));
        assert_eq!(object.output, json!({ "title": "Dune" }));
    }

    #[tokio::test]
    async fn labelled_kind_is_remembered() {
        let h = harness(MockProvider::new("prose"), EngineConfig::default());
        h.engine
            .execute(Request::new("essay").with_kind("markdown"))
            .await
            .unwrap();
        h.engine.wait_idle().await;
        let record = h.store.function("essay").await.unwrap().unwrap();
        assert_eq!(record.kind, ExecutionKind::Text);

        let again = h
            .engine
            .execute(Request::new("essay").with_arg("topic", json!("tides")))
            .await
            .unwrap();
        assert_eq!(again.kind, Some(ExecutionKind::Text));
    }

    #[tokio::test]
    async fn open_human_task_leaves_cache_writes_running() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new("fast answer"));
        let engine = Engine::builder()
            .with_config(EngineConfig::default().with_workers(1).with_retry_backoff_ms(1))
            .with_store(store.clone())
            .with_provider(provider.clone())
            .with_human_channel(Arc::new(InboxChannel::new()))
            .build()
            .unwrap();

        let pending = engine
            .execute(Request::new("approve").with_kind("human"))
            .await
            .unwrap();
        assert_eq!(pending.output["status"], "in-progress");

        let request = Request::new("quick").with_kind("text");
        engine.execute(request.clone()).await.unwrap();
        let hash = RequestHashes::compute(&request).request;
        let stored = tokio::time::timeout(Duration::from_secs(2), async {
            while store.action(&hash).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(stored.is_ok());

        let again = engine.execute(request).await.unwrap();
        assert!(again.cached);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn zero_ttl_regenerates() {
        let h = harness(MockProvider::new("plain words"), EngineConfig::default());
        let request = Request::new("describe")
            .with_kind("text")
            .with_settings(Settings {
                cache_ttl: Some(0),
                ..Settings::default()
            });

        h.engine.execute(request.clone()).await.unwrap();
        h.engine.wait_idle().await;
        let again = h.engine.execute(request).await.unwrap();
        assert!(!again.cached);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn empty_function_name_is_rejected() {
        let h = harness(MockProvider::new("x"), EngineConfig::default());
        let err = h.engine.execute(Request::new("  ")).await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn validation_failure_keeps_data_and_skips_cache() {
        let h = harness(
            MockProvider::new(r#"{"category":"footwear","confidence":"very"}"#),
            EngineConfig::default(),
        );

        let out = h.engine.execute(categorize()).await.unwrap();
        assert_eq!(out.output["category"], "footwear");
        assert!(schema::has_validation_error(&out.output));
        h.engine.wait_idle().await;
        assert_eq!(h.store.action_count(), 0);

        let again = h.engine.execute(categorize()).await.unwrap();
        assert!(!again.cached);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn provider_failure_is_returned_not_cached() {
        let h = harness(
            MockProvider::new("hello").then(Reply::Fail("boom".into())),
            EngineConfig::default(),
        );
        let request = Request::new("greet").with_kind("text");

        let out = h.engine.execute(request.clone()).await.unwrap();
        assert!(out.output["_error"].as_str().unwrap().contains("boom"));
        h.engine.wait_idle().await;

        let retry = h.engine.execute(request).await.unwrap();
        assert_eq!(retry.output, json!("hello"));
        assert!(!retry.cached);
    }

    #[tokio::test]
    async fn provider_timeout_yields_error_output() {
        let h = harness(
            MockProvider::new("late").then(Reply::Hang),
            EngineConfig::default().with_timeout_ms(20),
        );
        let out = h
            .engine
            .execute(Request::new("slow").with_kind("text"))
            .await
            .unwrap();
        assert!(out.output.get("_error").is_some());
    }

    #[tokio::test]
    async fn text_array_is_parsed_from_list() {
        let h = harness(
            MockProvider::new("1. red\n2. green\n3. blue"),
            EngineConfig::default(),
        );
        let out = h
            .engine
            .execute(Request::new("colors").with_shape(json!(["string"])))
            .await
            .unwrap();
        assert_eq!(out.kind, Some(ExecutionKind::TextArray));
        assert_eq!(out.output, json!(["red", "green", "blue"]));
    }

    #[tokio::test]
    async fn code_runs_in_sandbox_with_limits() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_function(
                FunctionRecord::new("add", ExecutionKind::Code).with_code("return { sum: a + b }"),
            )
            .await
            .unwrap();
        let sandbox = Arc::new(MockSandbox::always(json!({ "sum": 3 })));
        let provider = Arc::new(MockProvider::new("unused"));
        let engine = Engine::builder()
            .with_store(store.clone())
            .with_provider(provider.clone())
            .with_sandbox(sandbox.clone())
            .build()
            .unwrap();

        let request = Request::new("add")
            .with_args(json!({ "a": 1, "b": 2 }))
            .with_settings(Settings {
                memory_limit_mb: Some(64),
                ..Settings::default()
            });
        let out = engine.execute(request).await.unwrap();
        assert_eq!(out.kind, Some(ExecutionKind::Code));
        assert_eq!(out.output, json!({ "sum": 3 }));
        assert_eq!(provider.calls(), 0);

        let runs = sandbox.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, "return { sum: a + b }");
        assert_eq!(runs[0].2.memory_limit_mb, 64);
    }

    #[tokio::test]
    async fn human_dispatch_is_deterministic_and_superseded() {
        let store = Arc::new(MemoryStore::new());
        let inbox = Arc::new(InboxChannel::new());
        let engine = Engine::builder()
            .with_config(EngineConfig::default().with_retry_backoff_ms(1))
            .with_store(store.clone())
            .with_provider(Arc::new(MockProvider::new("unused")))
            .with_human_channel(inbox.clone())
            .build()
            .unwrap();
        let request = Request::new("approveRefund")
            .with_args(json!({ "order": 42 }))
            .with_kind("human");

        let first = engine.execute(request.clone()).await.unwrap();
        assert_eq!(first.kind, Some(ExecutionKind::Human));
        assert_eq!(first.output["status"], "in-progress");
        let task_id = first.output["taskId"].as_str().unwrap().to_string();

        let pending = engine.task(&task_id).await.unwrap().unwrap();
        assert_eq!(pending.status, crate::types::TaskStatus::Pending);

        let second = engine.execute(request.clone()).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.output, first.output);

        inbox
            .respond(&task_id, json!({ "approved": true }), Some("ops".into()))
            .unwrap();
        engine.wait_idle().await;

        let answered = engine.execute(request).await.unwrap();
        assert!(answered.cached);
        assert_eq!(answered.output, json!({ "approved": true }));
        let done = engine.task(&task_id).await.unwrap().unwrap();
        assert_eq!(done.status, crate::types::TaskStatus::Completed);
    }

    #[tokio::test]
    async fn human_without_channel_is_uncached_error() {
        let h = harness(MockProvider::new("unused"), EngineConfig::default());
        let out = h
            .engine
            .execute(Request::new("approve").with_kind("human"))
            .await
            .unwrap();
        assert!(out.output.get("_error").is_some());
        h.engine.wait_idle().await;
        assert_eq!(h.store.action_count(), 0);
    }

    #[tokio::test]
    async fn agent_without_id_is_config_error() {
        let h = harness(MockProvider::new("unused"), EngineConfig::default());
        let err = h
            .engine
            .execute(Request::new("research").with_kind("agent"))
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn coalescing_shares_one_generation() {
        let h = harness(
            MockProvider::new("unused").then(Reply::Slow("shared answer".into(), 50)),
            EngineConfig::default().with_coalescing(true),
        );
        let request = Request::new("summarize").with_kind("text");

        let (a, b) = tokio::join!(
            h.engine.execute(request.clone()),
            h.engine.execute(request.clone())
        );
        assert_eq!(a.unwrap().output, b.unwrap().output);
        assert_eq!(h.provider.calls(), 1);
        h.engine.wait_idle().await;
        assert_eq!(h.store.action_count(), 1);
    }

    #[tokio::test]
    async fn streaming_miss_then_cached_replay() {
        let h = harness(MockProvider::new("one two three"), EngineConfig::default());
        let request = Request::new("story").with_kind("text");

        let stream = h.engine.execute_stream(request.clone()).await.unwrap();
        assert!(!stream.is_cached());
        assert_eq!(stream.collect().await, "one two three");
        h.engine.wait_idle().await;
        assert_eq!(h.store.action_count(), 1);

        let replay = h.engine.execute_stream(request).await.unwrap();
        assert!(replay.is_cached());
        assert_eq!(replay.collect().await, "one two three");
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn run_honours_stream_setting() {
        let h = harness(MockProvider::new("streamed"), EngineConfig::default());
        let request = Request::new("speak")
            .with_kind("text")
            .with_settings(Settings {
                stream: true,
                ..Settings::default()
            });
        match h.engine.run(request).await.unwrap() {
            Outcome::Stream(stream) => assert_eq!(stream.collect().await, "streamed"),
            Outcome::Complete(_) => panic!("expected a stream"),
        }

        match h
            .engine
            .run(Request::new("speak").with_kind("text"))
            .await
            .unwrap()
        {
            Outcome::Complete(execution) => assert_eq!(execution.output, json!("streamed")),
            Outcome::Stream(_) => panic!("expected a complete execution"),
        }
    }

    #[tokio::test]
    async fn failed_lookups_are_logged_as_misses() {
        let sink = Arc::new(MemorySink::new());
        let logger = Arc::new(ExecLogger::new().with_sink(sink.clone()));
        let engine = Engine::builder()
            .with_store(Arc::new(MemoryStore::new()))
            .with_provider(Arc::new(MockProvider::new("fine")))
            .with_logger(logger)
            .build()
            .unwrap();
        engine
            .execute(Request::new("ok").with_kind("text"))
            .await
            .unwrap();
        assert!(sink.matching("lookup failed").is_empty());
        assert!(!sink.matching("miss").is_empty());
    }
}
