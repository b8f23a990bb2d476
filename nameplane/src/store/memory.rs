//! In-memory record store.

use std::cell::RefCell;
use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{apply_if, Condition, Record, RecordStore};
use crate::error::StoreError;

/// Record store backed by a `BTreeMap`.
///
/// All state is lost on drop. Interior mutability through `RefCell` is
/// enough because the control plane runs on a single thread; no borrow is
/// held across an await point.
#[derive(Debug)]
pub struct InMemoryRecordStore<R> {
    records: RefCell<BTreeMap<String, R>>,
}

impl<R: Record> InMemoryRecordStore<R> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: RefCell::new(BTreeMap::new()),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    /// Synchronous read, for invariant checkers that cannot await.
    pub fn peek(&self, key: &str) -> Option<R> {
        self.records.borrow().get(key).cloned()
    }

    /// Synchronous snapshot of every record.
    pub fn snapshot(&self) -> Vec<R> {
        self.records.borrow().values().cloned().collect()
    }
}

impl<R: Record> Default for InMemoryRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl<R: Record> RecordStore<R> for InMemoryRecordStore<R> {
    async fn get(&self, key: &str) -> Result<R, StoreError> {
        self.records
            .borrow()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, record: R) -> Result<(), StoreError> {
        let mut records = self.records.borrow_mut();
        let key = record.key().to_string();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        records.insert(key, record);
        Ok(())
    }

    async fn write(&self, key: &str, updates: &[R::Update]) -> Result<(), StoreError> {
        let mut records = self.records.borrow_mut();
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        apply_if(record, None, updates);
        Ok(())
    }

    async fn write_if(
        &self,
        key: &str,
        condition: &Condition<R::Field>,
        updates: &[R::Update],
    ) -> Result<bool, StoreError> {
        let mut records = self.records.borrow_mut();
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(apply_if(record, Some(condition), updates))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records
            .borrow_mut()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.borrow().contains_key(key))
    }

    async fn scan(&self) -> Result<Vec<R>, StoreError> {
        Ok(self.snapshot())
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
    use crate::record::{NameField, NameRecord, NameUpdate};
    use crate::store::Condition;
    use crate::types::{node_set, Version};

    fn record(name: &str) -> NameRecord {
        NameRecord::new(name, node_set([1, 2, 3]), Default::default(), 60)
    }

    #[tokio::test]
    async fn test_put_get_and_duplicate_put() {
        let store = InMemoryRecordStore::new();
        store.put(record("n1")).await.expect("put");

        let loaded = store.get("n1").await.expect("get");
        assert_eq!(loaded.active_version, Version::INITIAL);

        let err = store.put(record("n1")).await.expect_err("duplicate put");
        assert!(matches!(err, StoreError::AlreadyExists(ref k) if k == "n1"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store: InMemoryRecordStore<NameRecord> = InMemoryRecordStore::new();
        let err = store.get("missing").await.expect_err("missing record");
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!store.contains("missing").await.expect("contains"));
    }

    #[tokio::test]
    async fn test_write_if_applies_only_on_match() {
        let store = InMemoryRecordStore::new();
        store.put(record("n1")).await.expect("put");

        let stale = Condition::new(NameField::ActiveVersion, Version::new(7));
        let applied = store
            .write_if("n1", &stale, &[NameUpdate::SetTimeToLive(5)])
            .await
            .expect("write_if");
        assert!(!applied);
        assert_eq!(store.get("n1").await.expect("get").time_to_live, 60);

        let current = Condition::new(NameField::ActiveVersion, Version::INITIAL);
        let applied = store
            .write_if("n1", &current, &[NameUpdate::SetTimeToLive(5)])
            .await
            .expect("write_if");
        assert!(applied);
        assert_eq!(store.get("n1").await.expect("get").time_to_live, 5);
    }

    #[tokio::test]
    async fn test_write_if_on_non_scalar_field_never_applies() {
        let store = InMemoryRecordStore::new();
        store.put(record("n1")).await.expect("put");

        let condition = Condition::new(NameField::ValuesMap, true);
        let applied = store
            .write_if("n1", &condition, &[NameUpdate::SetTimeToLive(5)])
            .await
            .expect("write_if");
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_remove_scan_select() {
        let store = InMemoryRecordStore::new();
        store.put(record("a")).await.expect("put");
        store.put(record("b")).await.expect("put");
        store
            .write("b", &[NameUpdate::IncrementLookups(3)])
            .await
            .expect("write");

        let all = store.scan().await.expect("scan");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");

        let busy = store
            .select(&|r: &NameRecord| r.total_lookups > 0)
            .await
            .expect("select");
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].name, "b");

        store.remove("a").await.expect("remove");
        assert!(matches!(
            store.remove("a").await.expect_err("already removed"),
            StoreError::NotFound(_)
        ));
        assert_eq!(store.len(), 1);
    }
}
