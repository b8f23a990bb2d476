//! Record store abstraction.
//!
//! The [`RecordStore`] trait is the only shared mutable resource of the
//! control plane. Every protocol step that changes a record goes through
//! either [`RecordStore::write`] (unconditional, atomic per call) or
//! [`RecordStore::write_if`] (compare-and-set on one field). Concurrent
//! handlers for the same name are serialized by `write_if` alone.
//!
//! ```text
//! write_if(key, Condition { field, value }, updates)
//!    │
//!    ├── record[field] == value ──> apply all updates atomically ──> Ok(true)
//!    └── record[field] != value ──> no change ─────────────────────> Ok(false)
//! ```
//!
//! Two engines are provided:
//! - [`InMemoryRecordStore`]: lost on drop, used for tests and the simulator
//! - [`FileRecordStore`]: JSON snapshot on disk, survives restart

mod file;
mod memory;

pub use file::FileRecordStore;
pub use memory::InMemoryRecordStore;

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::types::Version;

/// Scalar value of a record field used as a write condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    /// A boolean field.
    Bool(bool),
    /// A generation field.
    Version(Version),
    /// A small integer field (flags, counters).
    Int(i64),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Version> for FieldValue {
    fn from(value: Version) -> Self {
        Self::Version(value)
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Version(v) => write!(f, "{}", v),
            Self::Int(i) => write!(f, "{}", i),
        }
    }
}

/// A structured record that can live in a [`RecordStore`].
///
/// Fields are addressed through the typed [`Record::Field`] enum and changed
/// through [`Record::Update`] values, so the store never deals in raw
/// string-keyed field bags.
pub trait Record: Clone + Debug + Serialize + DeserializeOwned + 'static {
    /// Field names of this record.
    type Field: Copy + Debug + Display;

    /// A single field update.
    type Update: Clone + Debug;

    /// Primary key.
    fn key(&self) -> &str;

    /// Current value of a scalar field, or `None` for non-scalar fields.
    fn field_value(&self, field: Self::Field) -> Option<FieldValue>;

    /// Apply one update in place.
    fn apply(&mut self, update: &Self::Update);
}

/// Condition of a [`RecordStore::write_if`] call.
#[derive(Debug, Clone, Copy)]
pub struct Condition<F> {
    /// Field to compare.
    pub field: F,
    /// Expected value.
    pub expected: FieldValue,
}

impl<F: Copy> Condition<F> {
    /// Condition `field == expected`.
    pub fn new(field: F, expected: impl Into<FieldValue>) -> Self {
        Self {
            field,
            expected: expected.into(),
        }
    }

    /// Whether the condition holds on `record`.
    ///
    /// Non-scalar fields never satisfy a condition.
    pub fn holds<R: Record<Field = F>>(&self, record: &R) -> bool {
        record.field_value(self.field) == Some(self.expected)
    }
}

/// Apply `updates` to `record` when `condition` holds.
///
/// Shared by the store engines so they agree on conditional semantics.
pub(crate) fn apply_if<R: Record>(
    record: &mut R,
    condition: Option<&Condition<R::Field>>,
    updates: &[R::Update],
) -> bool {
    if let Some(condition) = condition {
        if !condition.holds(record) {
            return false;
        }
    }
    for update in updates {
        record.apply(update);
    }
    true
}

/// Key-addressed store of structured records.
///
/// Every method either completes atomically or returns an error; errors are
/// never swallowed. [`StoreError::Unavailable`] on a write means the outcome
/// is unknown and callers must re-read to resolve it.
#[async_trait(?Send)]
pub trait RecordStore<R: Record> {
    /// Read a record.
    async fn get(&self, key: &str) -> Result<R, StoreError>;

    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] if the
    /// key is taken.
    async fn put(&self, record: R) -> Result<(), StoreError>;

    /// Apply all `updates` atomically.
    async fn write(&self, key: &str, updates: &[R::Update]) -> Result<(), StoreError>;

    /// Apply all `updates` atomically if `condition` holds.
    ///
    /// Returns whether the updates were applied.
    async fn write_if(
        &self,
        key: &str,
        condition: &Condition<R::Field>,
        updates: &[R::Update],
    ) -> Result<bool, StoreError>;

    /// Delete a record.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Whether a record exists.
    async fn contains(&self, key: &str) -> Result<bool, StoreError>;

    /// All records, ordered by key.
    async fn scan(&self) -> Result<Vec<R>, StoreError>;

    /// All records matching `predicate`, ordered by key.
    async fn select(
        &self,
        predicate: &dyn for<'a> Fn(&'a R) -> bool,
    ) -> Result<Vec<R>, StoreError>;
}
