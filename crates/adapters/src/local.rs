//! Local table store for drafts and settings

use crate::error::AdapterResult;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A named table of JSON records keyed by id
#[async_trait]
pub trait Table: Send + Sync {
    async fn get(&self, id: &str) -> AdapterResult<Option<Value>>;

    async fn put(&self, id: &str, record: Value) -> AdapterResult<()>;

    /// Shallow-merge `changes` into the record, creating it when missing
    async fn update(&self, id: &str, changes: Value) -> AdapterResult<Value>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> AdapterResult<bool>;

    /// Every record, ordered by id
    async fn all(&self) -> AdapterResult<Vec<(String, Value)>>;
}

pub trait LocalStore: Send + Sync {
    fn table(&self, name: &str) -> Arc<dyn Table>;
}

/// Merge the top-level fields of `changes` into `target`
pub fn merge(target: &mut Value, changes: Value) {
    match (target, changes) {
        (Value::Object(target), Value::Object(changes)) => {
            for (key, value) in changes {
                target.insert(key, value);
            }
        }
        (target, changes) => *target = changes,
    }
}

#[derive(Default)]
struct MemoryTable {
    rows: RwLock<BTreeMap<String, Value>>,
}

#[async_trait]
impl Table for MemoryTable {
    async fn get(&self, id: &str) -> AdapterResult<Option<Value>> {
        Ok(self.rows.read().get(id).cloned())
    }

    async fn put(&self, id: &str, record: Value) -> AdapterResult<()> {
        self.rows.write().insert(id.to_string(), record);
        Ok(())
    }

    async fn update(&self, id: &str, changes: Value) -> AdapterResult<Value> {
        let mut rows = self.rows.write();
        let record = rows
            .entry(id.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        merge(record, changes);
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> AdapterResult<bool> {
        Ok(self.rows.write().remove(id).is_some())
    }

    async fn all(&self) -> AdapterResult<Vec<(String, Value)>> {
        Ok(self
            .rows
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }
}

/// Tables kept in memory for the lifetime of the store
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Arc<MemoryTable>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn table(&self, name: &str) -> Arc<dyn Table> {
        self.tables
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

/// One JSON document per table under a root directory
pub struct FileStore {
    root: PathBuf,
    tables: Mutex<HashMap<String, Arc<FileTable>>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LocalStore for FileStore {
    fn table(&self, name: &str) -> Arc<dyn Table> {
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self.root.join(format!("{}.json", file));
        self.tables
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(FileTable {
                    path,
                    lock: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }
}

struct FileTable {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileTable {
    async fn load(&self) -> AdapterResult<BTreeMap<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, rows: &BTreeMap<String, Value>) -> AdapterResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(rows)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), records = rows.len(), "Wrote table");
        Ok(())
    }
}

#[async_trait]
impl Table for FileTable {
    async fn get(&self, id: &str) -> AdapterResult<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(id))
    }

    async fn put(&self, id: &str, record: Value) -> AdapterResult<()> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        rows.insert(id.to_string(), record);
        self.store(&rows).await
    }

    async fn update(&self, id: &str, changes: Value) -> AdapterResult<Value> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        let record = rows
            .entry(id.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        merge(record, changes);
        let merged = record.clone();
        self.store(&rows).await?;
        Ok(merged)
    }

    async fn delete(&self, id: &str) -> AdapterResult<bool> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        let removed = rows.remove(id).is_some();
        if removed {
            self.store(&rows).await?;
        }
        Ok(removed)
    }

    async fn all(&self) -> AdapterResult<Vec<(String, Value)>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_shallow() {
        let mut record = json!({ "a": 1, "nested": { "x": 1, "y": 2 } });
        merge(&mut record, json!({ "b": 2, "nested": { "x": 3 } }));
        assert_eq!(record, json!({ "a": 1, "b": 2, "nested": { "x": 3 } }));

        let mut scalar = json!(5);
        merge(&mut scalar, json!({ "a": 1 }));
        assert_eq!(scalar, json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn memory_tables_are_shared_by_name() {
        let store = MemoryStore::new();
        store.table("drafts").put("1", json!({ "status": "Draft" })).await.unwrap();

        let drafts = store.table("drafts");
        assert_eq!(drafts.get("1").await.unwrap(), Some(json!({ "status": "Draft" })));
        assert!(store.table("settings").get("1").await.unwrap().is_none());

        let merged = drafts.update("1", json!({ "title": "ad" })).await.unwrap();
        assert_eq!(merged, json!({ "status": "Draft", "title": "ad" }));
        assert!(drafts.delete("1").await.unwrap());
        assert!(!drafts.delete("1").await.unwrap());
    }
}
