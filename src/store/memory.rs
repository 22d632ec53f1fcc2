use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Mutex;

use crate::error::StoreResult;
use crate::types::{ActionRecord, ArgumentRecord, EventRecord, FunctionRecord, ShapeRecord, TaskRecord};

use super::RecordStore;

/// Concurrent in-memory store. Each record is replaced as a whole under its
/// shard lock, so readers never observe a half-written action.
pub struct MemoryStore {
    functions: DashMap<String, FunctionRecord>,
    shapes: DashMap<String, ShapeRecord>,
    arguments: DashMap<String, ArgumentRecord>,
    actions: DashMap<String, ActionRecord>,
    tasks: DashMap<String, TaskRecord>,
    events: Mutex<Vec<EventRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
            shapes: DashMap::new(),
            arguments: DashMap::new(),
            actions: DashMap::new(),
            tasks: DashMap::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn create_if_absent<T>(map: &DashMap<String, T>, key: String, record: T) -> bool {
    match map.entry(key) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(record);
            true
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn function(&self, name: &str) -> StoreResult<Option<FunctionRecord>> {
        Ok(self.functions.get(name).map(|r| r.clone()))
    }

    async fn shape(&self, hash: &str) -> StoreResult<Option<ShapeRecord>> {
        Ok(self.shapes.get(hash).map(|r| r.clone()))
    }

    async fn arguments(&self, hash: &str) -> StoreResult<Option<ArgumentRecord>> {
        Ok(self.arguments.get(hash).map(|r| r.clone()))
    }

    async fn action(&self, hash: &str) -> StoreResult<Option<ActionRecord>> {
        Ok(self.actions.get(hash).map(|r| r.clone()))
    }

    async fn create_function(&self, record: FunctionRecord) -> StoreResult<bool> {
        Ok(create_if_absent(&self.functions, record.name.clone(), record))
    }

    async fn create_shape(&self, record: ShapeRecord) -> StoreResult<bool> {
        Ok(create_if_absent(&self.shapes, record.hash.clone(), record))
    }

    async fn create_arguments(&self, record: ArgumentRecord) -> StoreResult<bool> {
        Ok(create_if_absent(&self.arguments, record.hash.clone(), record))
    }

    async fn put_action(&self, record: ActionRecord) -> StoreResult<()> {
        self.actions.insert(record.hash.clone(), record);
        Ok(())
    }

    async fn append_event(&self, event: EventRecord) -> StoreResult<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }

    async fn put_task(&self, task: TaskRecord) -> StoreResult<()> {
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn task(&self, id: &str) -> StoreResult<Option<TaskRecord>> {
        Ok(self.tasks.get(id).map(|r| r.clone()))
    }
}
