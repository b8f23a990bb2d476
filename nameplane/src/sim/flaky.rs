//! Store wrapper that makes conditional writes ambiguous.

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{Condition, InMemoryRecordStore, Record, RecordStore};

/// Wraps an [`InMemoryRecordStore`] and answers every `every`-th
/// conditional write with [`StoreError::Unavailable`].
///
/// Failures alternate between a write that landed and one that did not,
/// so callers see both outcomes behind the same error.
pub struct FlakyStore<R> {
    inner: Rc<InMemoryRecordStore<R>>,
    every: u32,
    writes: Cell<u32>,
    failures: Cell<u32>,
}

impl<R: Record> FlakyStore<R> {
    /// Wrap `inner`. `every == 0` never fails.
    pub fn new(inner: Rc<InMemoryRecordStore<R>>, every: u32) -> Self {
        Self {
            inner,
            every,
            writes: Cell::new(0),
            failures: Cell::new(0),
        }
    }

    /// Ambiguous failures injected so far.
    pub fn failures(&self) -> u32 {
        self.failures.get()
    }
}

#[async_trait(?Send)]
impl<R: Record> RecordStore<R> for FlakyStore<R> {
    async fn get(&self, key: &str) -> Result<R, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, record: R) -> Result<(), StoreError> {
        self.inner.put(record).await
    }

    async fn write(&self, key: &str, updates: &[R::Update]) -> Result<(), StoreError> {
        self.inner.write(key, updates).await
    }

    async fn write_if(
        &self,
        key: &str,
        condition: &Condition<R::Field>,
        updates: &[R::Update],
    ) -> Result<bool, StoreError> {
        let n = self.writes.get() + 1;
        self.writes.set(n);
        if self.every == 0 || n % self.every != 0 {
            return self.inner.write_if(key, condition, updates).await;
        }
        let failure = self.failures.get() + 1;
        self.failures.set(failure);
        if failure % 2 == 1 {
            self.inner.write_if(key, condition, updates).await?;
        }
        Err(StoreError::Unavailable(format!(
            "injected failure on {} ({})",
            key, condition.field
        )))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.contains(key).await
    }

    async fn scan(&self) -> Result<Vec<R>, StoreError> {
        self.inner.scan().await
    }

    async fn select(
        &self,
        predicate: &dyn for<'a> Fn(&'a R) -> bool,
    ) -> Result<Vec<R>, StoreError> {
        self.inner.select(predicate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ControllerField, ControllerRecord, ControllerUpdate};
    use crate::types::node_set;

    #[tokio::test]
    async fn test_failures_alternate_between_landed_and_lost() {
        let inner = Rc::new(InMemoryRecordStore::new());
        let store = FlakyStore::new(inner.clone(), 1);
        store
            .put(ControllerRecord::new("n1", node_set([1])))
            .await
            .expect("put");
        let cond = Condition::new(ControllerField::ActiveRunning, true);
        let off = [ControllerUpdate::SetActiveRunning(false)];
        let on = [ControllerUpdate::SetActiveRunning(true)];

        assert!(matches!(
            store.write_if("n1", &cond, &off).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(!inner.peek("n1").expect("record").active_running);

        let cond_off = Condition::new(ControllerField::ActiveRunning, false);
        assert!(matches!(
            store.write_if("n1", &cond_off, &on).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(!inner.peek("n1").expect("record").active_running);
        assert_eq!(store.failures(), 2);
    }
}
