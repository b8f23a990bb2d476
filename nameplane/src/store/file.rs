//! File-backed record store.
//!
//! Records are cached in memory and the whole table is persisted as a JSON
//! snapshot after every mutation. The snapshot is written to a temporary
//! file and renamed over the previous one, so a crash leaves either the old
//! or the new table on disk, never a torn one. A mutation whose snapshot
//! cannot be written is undone in memory before the error is returned.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{apply_if, Condition, Record, RecordStore};
use crate::error::StoreError;

/// Record store persisted as a JSON snapshot file.
#[derive(Debug)]
pub struct FileRecordStore<R> {
    path: PathBuf,
    records: RefCell<BTreeMap<String, R>>,
    /// Serializes snapshot writes so the last mutation is the last written.
    persist_lock: Mutex<()>,
}

impl<R: Record> FileRecordStore<R> {
    /// Open the store at `path`, loading the existing snapshot if any.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<R> = serde_json::from_slice(&bytes)?;
                list.into_iter()
                    .map(|record| (record.key().to_string(), record))
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), records = records.len(), "opened record store");
        Ok(Self {
            path,
            records: RefCell::new(records),
            persist_lock: Mutex::new(()),
        })
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the table to disk. If that fails, put `key` back to `previous`
    /// before releasing the lock, so no later snapshot carries the failed
    /// mutation.
    async fn persist(&self, key: &str, previous: Option<R>) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let result = self.write_snapshot().await;
        if let Err(err) = &result {
            warn!(path = %self.path.display(), key = %key, error = %err, "snapshot failed, mutation undone");
            let mut records = self.records.borrow_mut();
            match previous {
                Some(record) => {
                    records.insert(key.to_string(), record);
                }
                None => {
                    records.remove(key);
                }
            }
        }
        result
    }

    async fn write_snapshot(&self) -> Result<(), StoreError> {
        let bytes = {
            let records = self.records.borrow();
            serde_json::to_vec_pretty(&records.values().collect::<Vec<_>>())?
        };
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl<R: Record> RecordStore<R> for FileRecordStore<R> {
    async fn get(&self, key: &str) -> Result<R, StoreError> {
        self.records
            .borrow()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, record: R) -> Result<(), StoreError> {
        let key = record.key().to_string();
        {
            let mut records = self.records.borrow_mut();
            if records.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            records.insert(key.clone(), record);
        }
        self.persist(&key, None).await
    }

    async fn write(&self, key: &str, updates: &[R::Update]) -> Result<(), StoreError> {
        let previous = {
            let mut records = self.records.borrow_mut();
            let record = records
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let previous = record.clone();
            apply_if(record, None, updates);
            previous
        };
        self.persist(key, Some(previous)).await
    }

    async fn write_if(
        &self,
        key: &str,
        condition: &Condition<R::Field>,
        updates: &[R::Update],
    ) -> Result<bool, StoreError> {
        let previous = {
            let mut records = self.records.borrow_mut();
            let record = records
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let previous = record.clone();
            apply_if(record, Some(condition), updates).then_some(previous)
        };
        match previous {
            Some(previous) => {
                self.persist(key, Some(previous)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let previous = self
            .records
            .borrow_mut()
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.persist(key, Some(previous)).await
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.borrow().contains_key(key))
    }

    async fn scan(&self) -> Result<Vec<R>, StoreError> {
        Ok(self.records.borrow().values().cloned().collect())
    }

    async fn select(
        &self,
        predicate: &dyn for<'a> Fn(&'a R) -> bool,
    ) -> Result<Vec<R>, StoreError> {
        Ok(self
            .records
            .borrow()
            .values()
            .filter(|record| predicate(record))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ControllerField, ControllerRecord, ControllerUpdate};
    use crate::types::{node_set, Version};

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("controllers.json");

        {
            let store = FileRecordStore::open(&path).await.expect("open");
            store
                .put(ControllerRecord::new("n1", node_set([1, 2, 3])))
                .await
                .expect("put");
            let applied = store
                .write_if(
                    "n1",
                    &Condition::new(ControllerField::ActiveRunning, true),
                    &[ControllerUpdate::BeginGroupChange {
                        new_actives: node_set([4, 5, 6]),
                        new_version: Version::new(2),
                    }],
                )
                .await
                .expect("write_if");
            assert!(applied);
        }

        let reopened: FileRecordStore<ControllerRecord> =
            FileRecordStore::open(&path).await.expect("reopen");
        let record = reopened.get("n1").await.expect("get");
        assert_eq!(record.active_version, Version::new(2));
        assert_eq!(record.old_active_version, Version::INITIAL);
        assert_eq!(record.active_replicas, node_set([4, 5, 6]));
        assert!(!record.active_running);
    }

    #[tokio::test]
    async fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: FileRecordStore<ControllerRecord> =
            FileRecordStore::open(dir.path().join("none.json"))
                .await
                .expect("open");
        assert!(store.scan().await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("controllers.json");
        {
            let store = FileRecordStore::open(&path).await.expect("open");
            store
                .put(ControllerRecord::new("n1", node_set([1])))
                .await
                .expect("put");
            store.remove("n1").await.expect("remove");
        }
        let reopened: FileRecordStore<ControllerRecord> =
            FileRecordStore::open(&path).await.expect("reopen");
        assert!(!reopened.contains("n1").await.expect("contains"));
    }

    #[tokio::test]
    async fn test_failed_snapshot_undoes_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("names.json");
        let store = FileRecordStore::open(&path).await.expect("open");
        store
            .put(ControllerRecord::new("n0", node_set([1])))
            .await
            .expect("put");

        // A directory where the temporary snapshot goes makes every persist fail.
        let blocker = path.with_extension("tmp");
        std::fs::create_dir(&blocker).expect("block snapshot");

        let err = store
            .put(ControllerRecord::new("n1", node_set([1, 2, 3])))
            .await
            .expect_err("persist blocked");
        assert!(matches!(err, StoreError::Io(_)));
        assert!(!store.contains("n1").await.expect("contains"));

        let applied = store
            .write_if(
                "n0",
                &Condition::new(ControllerField::ActiveRunning, true),
                &[ControllerUpdate::SetActiveRunning(false)],
            )
            .await;
        assert!(matches!(applied, Err(StoreError::Io(_))));
        assert!(store.get("n0").await.expect("get").active_running);

        store.remove("n0").await.expect_err("persist blocked");
        assert!(store.contains("n0").await.expect("contains"));

        std::fs::remove_dir(&blocker).expect("unblock");
        store
            .put(ControllerRecord::new("n1", node_set([1, 2, 3])))
            .await
            .expect("retried put");

        let reopened: FileRecordStore<ControllerRecord> =
            FileRecordStore::open(&path).await.expect("reopen");
        assert!(reopened.contains("n1").await.expect("contains"));
        assert!(reopened.get("n0").await.expect("get").active_running);
    }
}
