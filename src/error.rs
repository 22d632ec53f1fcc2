use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider rate limited: {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Generation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Human channel error: {0}")]
    Human(String),

    #[error("Agent error: agent={agent_id}, {message}")]
    Agent { agent_id: String, message: String },

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ExecError {
    /// Configuration errors are the only failures that reach the caller.
    pub fn is_config(&self) -> bool {
        matches!(self, ExecError::Config(_))
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Errors raised by a record store. Lookups that fail with one of these are
/// treated as cache misses by the engine.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid record key {0:?}")]
    InvalidKey(String),

    #[error("Corrupt record {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
