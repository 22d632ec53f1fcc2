use std::sync::Arc;

use crate::agent::AgentRunner;
use crate::cache::{CachePolicy, InflightLeases};
use crate::config::EngineConfig;
use crate::error::{ExecError, ExecResult};
use crate::execlog::ExecLogger;
use crate::human::HumanChannel;
use crate::notify::{Notifier, WebhookNotifier};
use crate::provider::Provider;
use crate::sandbox::{CodeSandbox, NoopSandbox};
use crate::scheduler::{JobContext, RetryPolicy, Scheduler};
use crate::store::RecordStore;

use super::Engine;

/// Assembles an [`Engine`]. A provider and a store are required; everything
/// else has a default.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn RecordStore>>,
    provider: Option<Arc<dyn Provider>>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
    human: Option<Arc<dyn HumanChannel>>,
    agents: Option<Arc<dyn AgentRunner>>,
    notifier: Option<Arc<dyn Notifier>>,
    logger: Option<Arc<ExecLogger>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_human_channel(mut self, human: Arc<dyn HumanChannel>) -> Self {
        self.human = Some(human);
        self
    }

    pub fn with_agents(mut self, agents: Arc<dyn AgentRunner>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_logger(mut self, logger: Arc<ExecLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Validate the configuration and start the scheduler's workers. Must be
    /// called from inside a tokio runtime.
    pub fn build(self) -> ExecResult<Engine> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| ExecError::Config("engine needs a record store".into()))?;
        let provider = self
            .provider
            .ok_or_else(|| ExecError::Config("engine needs a model provider".into()))?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ExecError::Config(
                "engine must be built inside a tokio runtime".into(),
            ));
        }

        let logger = self.logger.unwrap_or_else(|| Arc::new(ExecLogger::tracing()));
        let context = JobContext {
            store: store.clone(),
            logger: logger.clone(),
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(WebhookNotifier::new())),
            human: self.human.clone(),
            agents: self.agents,
            retry: RetryPolicy {
                max_attempts: self.config.max_job_attempts,
                backoff_ms: self.config.retry_backoff_ms,
            },
        };
        let scheduler = Scheduler::start(context, self.config.workers, self.config.queue_capacity);

        Ok(Engine {
            policy: CachePolicy::new(self.config.default_cache_ttl_ms),
            config: self.config,
            store,
            provider,
            sandbox: self.sandbox.unwrap_or_else(|| Arc::new(NoopSandbox)),
            human: self.human,
            logger,
            scheduler: Arc::new(scheduler),
            leases: InflightLeases::new(),
        })
    }
}
