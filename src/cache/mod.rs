//! Cache policy and the concurrent record lookups that feed it.

mod lease;

pub use lease::{InflightLeases, Lease, LeaseGuard};

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::hash::RequestHashes;
use crate::store::RecordStore;
use crate::types::{ActionRecord, ArgumentRecord, FunctionRecord, Settings, ShapeRecord};

/// 24 hours.
pub const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Decides whether a stored action is still fresh.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    default_ttl_ms: u64,
}

impl CachePolicy {
    pub fn new(default_ttl_ms: u64) -> Self {
        Self { default_ttl_ms }
    }

    /// `settings.cacheTTL`, or the configured default.
    pub fn ttl_for(&self, settings: &Settings) -> u64 {
        settings.cache_ttl.unwrap_or(self.default_ttl_ms)
    }

    pub fn is_valid(record: &ActionRecord, ttl_ms: u64) -> bool {
        Self::is_valid_at(record, ttl_ms, Utc::now())
    }

    /// `now - created_at < ttl`. Records stamped in the future count as fresh.
    pub fn is_valid_at(record: &ActionRecord, ttl_ms: u64, now: DateTime<Utc>) -> bool {
        let age_ms = (now - record.created_at).num_milliseconds();
        age_ms < i64::try_from(ttl_ms).unwrap_or(i64::MAX)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_MS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Function,
    Shape,
    Arguments,
    Action,
}

impl std::fmt::Display for LookupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupKind::Function => write!(f, "function"),
            LookupKind::Shape => write!(f, "shape"),
            LookupKind::Arguments => write!(f, "arguments"),
            LookupKind::Action => write!(f, "action"),
        }
    }
}

/// Outcome of the four best-effort lookups. A failed lookup is recorded in
/// `errors` and reads as a miss.
#[derive(Debug, Default)]
pub struct Lookups {
    pub function: Option<FunctionRecord>,
    pub shape: Option<ShapeRecord>,
    pub arguments: Option<ArgumentRecord>,
    pub action: Option<ActionRecord>,
    pub errors: Vec<(LookupKind, StoreError)>,
}

impl Lookups {
    /// Run the function, shape, arguments and action lookups concurrently.
    pub async fn gather(store: &dyn RecordStore, function_name: &str, hashes: &RequestHashes) -> Self {
        let shape_lookup = async {
            match &hashes.shape {
                Some(hash) => store.shape(hash).await,
                None => Ok(None),
            }
        };
        let (function, shape, arguments, action) = tokio::join!(
            store.function(function_name),
            shape_lookup,
            store.arguments(&hashes.args),
            store.action(&hashes.request),
        );

        let mut lookups = Lookups::default();
        lookups.function = settle(function, LookupKind::Function, &mut lookups.errors);
        lookups.shape = settle(shape, LookupKind::Shape, &mut lookups.errors);
        lookups.arguments = settle(arguments, LookupKind::Arguments, &mut lookups.errors);
        lookups.action = settle(action, LookupKind::Action, &mut lookups.errors);
        lookups
    }

    pub fn degraded(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The stored action, if it is still fresh under `ttl_ms`.
    pub fn fresh_action(&self, ttl_ms: u64) -> Option<&ActionRecord> {
        self.action
            .as_ref()
            .filter(|record| CachePolicy::is_valid(record, ttl_ms))
    }
}

fn settle<T>(
    result: Result<Option<T>, StoreError>,
    kind: LookupKind,
    errors: &mut Vec<(LookupKind, StoreError)>,
) -> Option<T> {
    match result {
        Ok(found) => found,
        Err(e) => {
            errors.push((kind, e));
            None
        }
    }
}
