//! Record store: hash-keyed persistence for the engine's canonical records.
//!
//! Four record kinds back the cache (functions, shapes, argument sets and
//! actions); events and tasks ride along. Creation of functions, shapes and
//! argument sets is "create if absent" and tolerates duplicate concurrent
//! creation. Actions are replaced whole (last write wins), never patched.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{ActionRecord, ArgumentRecord, EventRecord, FunctionRecord, ShapeRecord, TaskRecord};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn function(&self, name: &str) -> StoreResult<Option<FunctionRecord>>;

    async fn shape(&self, hash: &str) -> StoreResult<Option<ShapeRecord>>;

    async fn arguments(&self, hash: &str) -> StoreResult<Option<ArgumentRecord>>;

    async fn action(&self, hash: &str) -> StoreResult<Option<ActionRecord>>;

    /// Returns `true` when the record was created, `false` when one existed.
    async fn create_function(&self, record: FunctionRecord) -> StoreResult<bool>;

    async fn create_shape(&self, record: ShapeRecord) -> StoreResult<bool>;

    async fn create_arguments(&self, record: ArgumentRecord) -> StoreResult<bool>;

    /// Atomically replace the action stored under `record.hash`.
    async fn put_action(&self, record: ActionRecord) -> StoreResult<()>;

    async fn append_event(&self, event: EventRecord) -> StoreResult<()>;

    async fn put_task(&self, task: TaskRecord) -> StoreResult<()>;

    async fn task(&self, id: &str) -> StoreResult<Option<TaskRecord>>;
}
