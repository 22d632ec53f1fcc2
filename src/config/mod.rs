//! Engine configuration.
//!
//! Every field has a serde default so partial JSON/TOML documents work, and
//! [`EngineConfig::from_env`] overlays `EXEC_*` environment variables.

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, ExecResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TTL applied when a request carries no `cacheTTL`.
    #[serde(default = "default_cache_ttl_ms")]
    pub default_cache_ttl_ms: u64,

    /// Generation timeout applied when a request carries no `timeout`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub default_temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    #[serde(default = "default_sandbox_memory_limit_mb")]
    pub sandbox_memory_limit_mb: u64,

    /// How long a human feedback monitor waits before giving up.
    #[serde(default = "default_human_timeout_ms")]
    pub human_timeout_ms: u64,

    /// Bounded capacity of the background job queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per background job before it is dropped and logged.
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,

    /// Linear backoff step between job attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Share one in-flight generation between concurrent misses on a hash.
    #[serde(default)]
    pub coalesce_inflight: bool,
}

fn default_cache_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f64 {
    0.0
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_sandbox_memory_limit_mb() -> u64 {
    128
}
fn default_human_timeout_ms() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_workers() -> usize {
    4
}
fn default_max_job_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_cache_ttl_ms: default_cache_ttl_ms(),
            default_timeout_ms: default_timeout_ms(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            sandbox_memory_limit_mb: default_sandbox_memory_limit_mb(),
            human_timeout_ms: default_human_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            max_job_attempts: default_max_job_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            coalesce_inflight: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `EXEC_*` environment variables.
    pub fn from_env() -> ExecResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ExecResult<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("EXEC_CACHE_TTL_MS") {
            config.default_cache_ttl_ms = parse_var("EXEC_CACHE_TTL_MS", &v)?;
        }
        if let Some(v) = lookup("EXEC_TIMEOUT_MS") {
            config.default_timeout_ms = parse_var("EXEC_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EXEC_MODEL") {
            config.default_model = v;
        }
        if let Some(v) = lookup("EXEC_TEMPERATURE") {
            config.default_temperature = parse_var("EXEC_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("EXEC_MAX_TOKENS") {
            config.default_max_tokens = parse_var("EXEC_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("EXEC_SANDBOX_MEMORY_MB") {
            config.sandbox_memory_limit_mb = parse_var("EXEC_SANDBOX_MEMORY_MB", &v)?;
        }
        if let Some(v) = lookup("EXEC_HUMAN_TIMEOUT_MS") {
            config.human_timeout_ms = parse_var("EXEC_HUMAN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EXEC_QUEUE_CAPACITY") {
            config.queue_capacity = parse_var("EXEC_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("EXEC_WORKERS") {
            config.workers = parse_var("EXEC_WORKERS", &v)?;
        }
        if let Some(v) = lookup("EXEC_MAX_JOB_ATTEMPTS") {
            config.max_job_attempts = parse_var("EXEC_MAX_JOB_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("EXEC_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = parse_var("EXEC_RETRY_BACKOFF_MS", &v)?;
        }
        if let Some(v) = lookup("EXEC_COALESCE_INFLIGHT") {
            config.coalesce_inflight = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> ExecResult<()> {
        if self.workers == 0 {
            return Err(ExecError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ExecError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_job_attempts == 0 {
            return Err(ExecError::Config("max_job_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_cache_ttl_ms(mut self, ttl: u64) -> Self {
        self.default_cache_ttl_ms = ttl;
        self
    }

    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.default_timeout_ms = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff: u64) -> Self {
        self.retry_backoff_ms = backoff;
        self
    }

    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalesce_inflight = enabled;
        self
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> ExecResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ExecError::Config(format!("invalid value for {key}: {value:?}")))
}
