use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::hash::digest;
use crate::types::{ActionRecord, ArgumentRecord, EventRecord, FunctionRecord, ShapeRecord, TaskRecord};

use super::RecordStore;

/// Directory-backed store: one JSON document per record, events as JSONL.
///
/// ```text
/// base_dir/
///   functions/<sha256(name)>.json
///   shapes/<hash>.json
///   arguments/<hash>.json
///   actions/<hash>.json
///   tasks/<id>.json
///   events.jsonl
/// ```
///
/// Documents are written to a temp file and renamed into place, so a reader
/// sees either the previous record or the new one.
pub struct FileStore {
    base_dir: PathBuf,
    events_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            events_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Keys become file names, so anything that could leave the collection
    /// directory is refused.
    fn doc_path(&self, collection: &str, key: &str) -> StoreResult<PathBuf> {
        let unsafe_key = key.is_empty()
            || key.starts_with('.')
            || key.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
        if unsafe_key {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(collection).join(format!("{key}.json")))
    }

    fn function_key(name: &str) -> String {
        digest(&serde_json::Value::String(name.to_string()))
    }

    fn events_path(&self) -> PathBuf {
        self.base_dir.join("events.jsonl")
    }

    async fn read_doc<T: DeserializeOwned>(&self, collection: &str, key: &str) -> StoreResult<Option<T>> {
        let path = self.doc_path(collection, key)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: format!("{collection}/{key}"),
                message: e.to_string(),
            })
    }

    async fn write_doc<T: Serialize>(&self, collection: &str, key: &str, record: &T) -> StoreResult<()> {
        let path = self.doc_path(collection, key)?;
        let dir = self.base_dir.join(collection);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn create_doc<T: Serialize>(&self, collection: &str, key: &str, record: &T) -> StoreResult<bool> {
        if tokio::fs::try_exists(self.doc_path(collection, key)?).await? {
            return Ok(false);
        }
        // Two racing creators both write the same content-addressed record.
        self.write_doc(collection, key, record).await?;
        Ok(true)
    }

    /// Read back the event log. Unparseable lines are skipped.
    pub async fn load_events(&self) -> StoreResult<Vec<EventRecord>> {
        let path = self.events_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn function(&self, name: &str) -> StoreResult<Option<FunctionRecord>> {
        self.read_doc("functions", &Self::function_key(name)).await
    }

    async fn shape(&self, hash: &str) -> StoreResult<Option<ShapeRecord>> {
        self.read_doc("shapes", hash).await
    }

    async fn arguments(&self, hash: &str) -> StoreResult<Option<ArgumentRecord>> {
        self.read_doc("arguments", hash).await
    }

    async fn action(&self, hash: &str) -> StoreResult<Option<ActionRecord>> {
        self.read_doc("actions", hash).await
    }

    async fn create_function(&self, record: FunctionRecord) -> StoreResult<bool> {
        self.create_doc("functions", &Self::function_key(&record.name), &record)
            .await
    }

    async fn create_shape(&self, record: ShapeRecord) -> StoreResult<bool> {
        self.create_doc("shapes", &record.hash, &record).await
    }

    async fn create_arguments(&self, record: ArgumentRecord) -> StoreResult<bool> {
        self.create_doc("arguments", &record.hash, &record).await
    }

    async fn put_action(&self, record: ActionRecord) -> StoreResult<()> {
        self.write_doc("actions", &record.hash, &record).await
    }

    async fn append_event(&self, event: EventRecord) -> StoreResult<()> {
        let _guard = self.events_lock.lock().await;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let line = serde_json::to_string(&event)? + "\n";
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn put_task(&self, task: TaskRecord) -> StoreResult<()> {
        self.write_doc("tasks", &task.id, &task).await
    }

    async fn task(&self, id: &str) -> StoreResult<Option<TaskRecord>> {
        self.read_doc("tasks", id).await
    }
}
