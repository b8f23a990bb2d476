//! Name record: the value of a name, owned by one active generation.
//!
//! ## Generations
//!
//! `active_version` names the generation currently allowed to serve and
//! mutate `values`. When a generation is stopped, its values move into
//! `old_values` and `old_active_version` remembers which generation they
//! came from, so the next generation can fetch them:
//!
//! ```text
//!                 active  old   values   old_values
//! serving v1        v1     0     {a}        {}
//! v1 stopped        0      v1    {}         {a}
//! v2 installed      v2     v1    {a}        {a}
//! v1 state deleted  v2     0     {a}        {}
//! ```
//!
//! A write tagged with any generation other than `active_version` is
//! rejected.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{applied_or, write_resolved, SkipReason, Transition};
use crate::error::StoreError;
use crate::store::{Condition, FieldValue, Record, RecordStore};
use crate::types::{NodeSet, ValuesMap, Version};

/// Per-name record held by active replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    /// Registered name, the primary key.
    #[serde(rename = "nr_name")]
    pub name: String,

    /// Replica controllers of this name.
    #[serde(rename = "nr_primary")]
    pub primary_replicas: NodeSet,

    /// Generation allowed to serve, [`Version::ZERO`] once retired.
    #[serde(rename = "nr_version")]
    pub active_version: Version,

    /// Generation whose values sit in `old_values`.
    #[serde(rename = "nr_oldVersion")]
    pub old_active_version: Version,

    /// Time to live of served values, in seconds.
    #[serde(rename = "nr_ttl")]
    pub time_to_live: u32,

    /// Current values.
    #[serde(rename = "nr_valuesMap")]
    pub values: ValuesMap,

    /// Values captured when `old_active_version` was retired.
    #[serde(rename = "nr_oldValuesMap")]
    pub old_values: ValuesMap,

    /// Number of accepted updates.
    #[serde(rename = "nr_totalUpdate")]
    pub total_updates: u64,

    /// Number of served lookups.
    #[serde(rename = "nr_totalLookup")]
    pub total_lookups: u64,
}

/// How a generation relates to a [`NameRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    /// The generation is serving.
    Current,
    /// The generation was retired and its values are still held.
    Old,
    /// The record knows nothing about the generation.
    Unknown,
}

impl NameRecord {
    /// Record of a freshly registered name served by its controllers at
    /// [`Version::INITIAL`].
    pub fn new(name: &str, primaries: NodeSet, values: ValuesMap, ttl: u32) -> Self {
        Self::for_generation(name, primaries, Version::INITIAL, values, ttl)
    }

    /// Record of a name installed on a node joining at `version`.
    pub fn for_generation(
        name: &str,
        primaries: NodeSet,
        version: Version,
        values: ValuesMap,
        ttl: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            primary_replicas: primaries,
            active_version: version,
            old_active_version: Version::ZERO,
            time_to_live: ttl,
            values,
            old_values: ValuesMap::new(),
            total_updates: 0,
            total_lookups: 0,
        }
    }

    /// Classify `version` against this record.
    pub fn version_status(&self, version: Version) -> VersionStatus {
        if version.is_zero() {
            VersionStatus::Unknown
        } else if version == self.active_version {
            VersionStatus::Current
        } else if version == self.old_active_version {
            VersionStatus::Old
        } else {
            VersionStatus::Unknown
        }
    }

    /// Values retired from `old_version`, if this record still holds them.
    pub fn old_values_on_version_match(&self, old_version: Version) -> Option<&ValuesMap> {
        (!old_version.is_zero() && self.old_active_version == old_version)
            .then_some(&self.old_values)
    }
}

/// Fields of a [`NameRecord`], with their persisted names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameField {
    /// `nr_name`
    Name,
    /// `nr_primary`
    PrimaryReplicas,
    /// `nr_version`
    ActiveVersion,
    /// `nr_oldVersion`
    OldActiveVersion,
    /// `nr_ttl`
    TimeToLive,
    /// `nr_valuesMap`
    ValuesMap,
    /// `nr_oldValuesMap`
    OldValuesMap,
    /// `nr_totalUpdate`
    TotalUpdates,
    /// `nr_totalLookup`
    TotalLookups,
}

impl NameField {
    /// Every field, in declaration order.
    pub const ALL: [NameField; 9] = [
        Self::Name,
        Self::PrimaryReplicas,
        Self::ActiveVersion,
        Self::OldActiveVersion,
        Self::TimeToLive,
        Self::ValuesMap,
        Self::OldValuesMap,
        Self::TotalUpdates,
        Self::TotalLookups,
    ];

    /// Persisted field name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "nr_name",
            Self::PrimaryReplicas => "nr_primary",
            Self::ActiveVersion => "nr_version",
            Self::OldActiveVersion => "nr_oldVersion",
            Self::TimeToLive => "nr_ttl",
            Self::ValuesMap => "nr_valuesMap",
            Self::OldValuesMap => "nr_oldValuesMap",
            Self::TotalUpdates => "nr_totalUpdate",
            Self::TotalLookups => "nr_totalLookup",
        }
    }
}

impl std::fmt::Display for NameField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single update of a [`NameRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameUpdate {
    /// Replace current values.
    SetValues(ValuesMap),
    /// Replace the time to live.
    SetTimeToLive(u32),
    /// Add to the lookup counter.
    IncrementLookups(u64),
    /// Add to the update counter.
    IncrementUpdates(u64),
    /// Retire the active generation: its values become the old values and
    /// the active version drops to the sentinel.
    RetireActive,
    /// Start serving `version` with the values fetched from the previous
    /// generation.
    InstallGeneration {
        /// Generation to serve.
        version: Version,
        /// Values carried over.
        values: ValuesMap,
        /// Time to live carried over.
        ttl: u32,
    },
    /// Forget the retired generation.
    DiscardOldState,
}

impl Record for NameRecord {
    type Field = NameField;
    type Update = NameUpdate;

    fn key(&self) -> &str {
        &self.name
    }

    fn field_value(&self, field: NameField) -> Option<FieldValue> {
        match field {
            NameField::ActiveVersion => Some(self.active_version.into()),
            NameField::OldActiveVersion => Some(self.old_active_version.into()),
            NameField::TimeToLive => Some(FieldValue::Int(self.time_to_live.into())),
            NameField::TotalUpdates => Some(FieldValue::Int(self.total_updates as i64)),
            NameField::TotalLookups => Some(FieldValue::Int(self.total_lookups as i64)),
            NameField::Name
            | NameField::PrimaryReplicas
            | NameField::ValuesMap
            | NameField::OldValuesMap => None,
        }
    }

    fn apply(&mut self, update: &NameUpdate) {
        match update {
            NameUpdate::SetValues(values) => self.values = values.clone(),
            NameUpdate::SetTimeToLive(ttl) => self.time_to_live = *ttl,
            NameUpdate::IncrementLookups(n) => self.total_lookups += n,
            NameUpdate::IncrementUpdates(n) => self.total_updates += n,
            NameUpdate::RetireActive => {
                self.old_active_version = self.active_version;
                self.old_values = std::mem::take(&mut self.values);
                self.active_version = Version::ZERO;
            }
            NameUpdate::InstallGeneration {
                version,
                values,
                ttl,
            } => {
                self.active_version = *version;
                self.values = values.clone();
                self.time_to_live = *ttl;
            }
            NameUpdate::DiscardOldState => {
                self.old_active_version = Version::ZERO;
                self.old_values.clear();
            }
        }
    }
}

/// Name record operations on top of a [`RecordStore`].
///
/// Every state change is a conditional write keyed on a generation field.
/// When the store reports [`StoreError::Unavailable`] the outcome of a write
/// is unknown; it is resolved by re-reading the record, and the write is
/// reissued while its condition still holds.
#[derive(Clone)]
pub struct NameRecords {
    store: Rc<dyn RecordStore<NameRecord>>,
}

impl NameRecords {
    /// Wrap a store.
    pub fn new(store: Rc<dyn RecordStore<NameRecord>>) -> Self {
        Self { store }
    }

    /// Insert a new record.
    pub async fn create(&self, record: NameRecord) -> Result<(), StoreError> {
        self.store.put(record).await
    }

    /// Read a record.
    pub async fn get(&self, name: &str) -> Result<NameRecord, StoreError> {
        self.store.get(name).await
    }

    /// Whether a record exists.
    pub async fn contains(&self, name: &str) -> Result<bool, StoreError> {
        self.store.contains(name).await
    }

    /// Every record held.
    pub async fn scan(&self) -> Result<Vec<NameRecord>, StoreError> {
        self.store.scan().await
    }

    /// Classify `version` against the stored record.
    pub async fn version_status(
        &self,
        name: &str,
        version: Version,
    ) -> Result<VersionStatus, StoreError> {
        Ok(self.get(name).await?.version_status(version))
    }

    /// Values and time to live retired from `old_version`, if still held.
    pub async fn old_values_on_version_match(
        &self,
        name: &str,
        old_version: Version,
    ) -> Result<Option<(ValuesMap, u32)>, StoreError> {
        let record = self.get(name).await?;
        Ok(record
            .old_values_on_version_match(old_version)
            .map(|values| (values.clone(), record.time_to_live)))
    }

    /// Replace the values of `name`, tagged with the writer's generation.
    pub async fn update_values(
        &self,
        name: &str,
        version: Version,
        values: ValuesMap,
    ) -> Result<Transition, StoreError> {
        let record = self.get(name).await?;
        match record.version_status(version) {
            VersionStatus::Current => {}
            VersionStatus::Old => {
                return Ok(Transition::NotApplied(SkipReason::GenerationStopped(
                    version,
                )))
            }
            VersionStatus::Unknown => {
                return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                    current: record.active_version,
                    requested: version,
                }))
            }
        }
        let expected = values.clone();
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(NameField::ActiveVersion, version),
            &[NameUpdate::SetValues(values), NameUpdate::IncrementUpdates(1)],
            |r| r.active_version == version && r.values == expected,
        )
        .await?;
        Ok(applied_or(applied, SkipReason::ConditionFailed))
    }

    /// Count one served lookup.
    pub async fn record_lookup(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .write(name, &[NameUpdate::IncrementLookups(1)])
            .await
    }

    /// Retire generation `version`: move current values to old values.
    ///
    /// Conditioned on `active_version == version`, so a repeated stop of the
    /// same generation cannot redo the transfer.
    pub async fn retire_active(
        &self,
        name: &str,
        version: Version,
    ) -> Result<Transition, StoreError> {
        let record = self.get(name).await?;
        if record.active_version != version {
            let reason = if record.old_active_version == version || record.active_version > version
            {
                SkipReason::Duplicate
            } else {
                SkipReason::StaleVersion {
                    current: record.active_version,
                    requested: version,
                }
            };
            return Ok(Transition::NotApplied(reason));
        }
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(NameField::ActiveVersion, version),
            &[NameUpdate::RetireActive],
            |r| r.active_version != version && r.old_active_version == version,
        )
        .await?;
        Ok(applied_or(applied, SkipReason::ConditionFailed))
    }

    /// Start serving `version` on this node with the values carried over
    /// from the previous generation.
    ///
    /// A node holding no record gets a fresh one. A node that still serves
    /// an older generation must retire it first.
    pub async fn install_generation(
        &self,
        name: &str,
        primaries: &NodeSet,
        version: Version,
        values: ValuesMap,
        ttl: u32,
    ) -> Result<Transition, StoreError> {
        let record = match self.get(name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                let fresh =
                    NameRecord::for_generation(name, primaries.clone(), version, values, ttl);
                return match self.store.put(fresh).await {
                    Ok(()) => Ok(Transition::Applied),
                    Err(StoreError::AlreadyExists(_)) => {
                        Ok(Transition::NotApplied(SkipReason::ConditionFailed))
                    }
                    Err(err) => Err(err),
                };
            }
            Err(err) => return Err(err),
        };

        if record.active_version == version {
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        if !record.active_version.is_zero() || record.old_active_version >= version {
            return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                current: record.active_version.max(record.old_active_version),
                requested: version,
            }));
        }
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(NameField::ActiveVersion, Version::ZERO),
            &[NameUpdate::InstallGeneration {
                version,
                values,
                ttl,
            }],
            |r| r.active_version == version,
        )
        .await?;
        Ok(applied_or(applied, SkipReason::ConditionFailed))
    }

    /// Garbage-collect the values retired from `old_version`.
    ///
    /// Conditioned on `old_active_version == old_version`: a late request
    /// for an older generation cannot erase newer retired values.
    pub async fn delete_old_state(
        &self,
        name: &str,
        old_version: Version,
    ) -> Result<Transition, StoreError> {
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(NameField::OldActiveVersion, old_version),
            &[NameUpdate::DiscardOldState],
            |r| r.old_active_version != old_version,
        )
        .await?;
        if applied {
            debug!(name = %name, old_version = %old_version, "old state deleted");
        }
        Ok(applied_or(applied, SkipReason::Duplicate))
    }

    /// Delete the record if it is still served by `version`.
    pub async fn remove_generation(
        &self,
        name: &str,
        version: Version,
    ) -> Result<Transition, StoreError> {
        let record = match self.get(name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Ok(Transition::NotApplied(SkipReason::Duplicate))
            }
            Err(err) => return Err(err),
        };
        if record.active_version != version {
            return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                current: record.active_version,
                requested: version,
            }));
        }
        match self.store.remove(name).await {
            Ok(()) => Ok(Transition::Applied),
            Err(StoreError::NotFound(_)) => Ok(Transition::NotApplied(SkipReason::Duplicate)),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use crate::types::node_set;

    fn values(v: &str) -> ValuesMap {
        let mut map = ValuesMap::new();
        map.insert("A".to_string(), vec![v.to_string()]);
        map
    }

    async fn table_with(record: NameRecord) -> NameRecords {
        let store = Rc::new(InMemoryRecordStore::new());
        let records = NameRecords::new(store);
        records.create(record).await.expect("create");
        records
    }

    #[test]
    fn test_field_names_match_serialized_keys() {
        let record = NameRecord::new("n1", node_set([1]), values("x"), 60);
        let json = serde_json::to_value(&record).expect("json");
        let object = json.as_object().expect("object");
        assert_eq!(object.len(), NameField::ALL.len());
        for field in NameField::ALL {
            assert!(object.contains_key(field.as_str()), "missing {}", field);
        }
    }

    #[test]
    fn test_current_and_old_values_deserialize_separately() {
        let mut record = NameRecord::new("n1", node_set([1]), values("new"), 60);
        record.old_values = values("old");
        record.old_active_version = Version::new(4);

        let json = serde_json::to_string(&record).expect("json");
        let back: NameRecord = serde_json::from_str(&json).expect("parse");
        assert_eq!(back.values, values("new"));
        assert_eq!(back.old_values, values("old"));
    }

    #[test]
    fn test_version_status() {
        let mut record = NameRecord::new("n1", node_set([1]), values("x"), 60);
        record.active_version = Version::new(3);
        record.old_active_version = Version::new(2);

        assert_eq!(record.version_status(Version::new(3)), VersionStatus::Current);
        assert_eq!(record.version_status(Version::new(2)), VersionStatus::Old);
        assert_eq!(record.version_status(Version::new(1)), VersionStatus::Unknown);
        assert_eq!(record.version_status(Version::ZERO), VersionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_retire_then_install_then_delete() {
        let records = table_with(NameRecord::new("n1", node_set([1, 2, 3]), values("a"), 60)).await;

        let t = records.retire_active("n1", Version::INITIAL).await.expect("retire");
        assert_eq!(t, Transition::Applied);
        let r = records.get("n1").await.expect("get");
        assert_eq!(r.active_version, Version::ZERO);
        assert_eq!(r.old_active_version, Version::INITIAL);
        assert!(r.values.is_empty());
        assert_eq!(r.old_values, values("a"));

        let t = records
            .install_generation("n1", &node_set([1, 2, 3]), Version::new(2), values("a"), 60)
            .await
            .expect("install");
        assert_eq!(t, Transition::Applied);

        let t = records
            .delete_old_state("n1", Version::INITIAL)
            .await
            .expect("delete");
        assert_eq!(t, Transition::Applied);
        let r = records.get("n1").await.expect("get");
        assert_eq!(r.active_version, Version::new(2));
        assert_eq!(r.old_active_version, Version::ZERO);
        assert!(r.old_values.is_empty());
        assert_eq!(r.values, values("a"));
    }

    #[tokio::test]
    async fn test_retire_twice_is_duplicate() {
        let records = table_with(NameRecord::new("n1", node_set([1]), values("a"), 60)).await;
        records.retire_active("n1", Version::INITIAL).await.expect("retire");

        let t = records.retire_active("n1", Version::INITIAL).await.expect("retire");
        assert_eq!(t, Transition::NotApplied(SkipReason::Duplicate));
        let r = records.get("n1").await.expect("get");
        assert_eq!(r.old_values, values("a"));
    }

    #[tokio::test]
    async fn test_update_rejected_for_stopped_and_unknown_generation() {
        let records = table_with(NameRecord::new("n1", node_set([1]), values("a"), 60)).await;

        let t = records
            .update_values("n1", Version::INITIAL, values("b"))
            .await
            .expect("update");
        assert_eq!(t, Transition::Applied);

        records.retire_active("n1", Version::INITIAL).await.expect("retire");
        let t = records
            .update_values("n1", Version::INITIAL, values("c"))
            .await
            .expect("update");
        assert_eq!(
            t,
            Transition::NotApplied(SkipReason::GenerationStopped(Version::INITIAL))
        );

        let t = records
            .update_values("n1", Version::new(9), values("c"))
            .await
            .expect("update");
        assert!(matches!(
            t,
            Transition::NotApplied(SkipReason::StaleVersion { .. })
        ));

        let r = records.get("n1").await.expect("get");
        assert_eq!(r.old_values, values("b"));
        assert_eq!(r.total_updates, 1);
    }

    #[tokio::test]
    async fn test_delete_old_state_ignores_mismatched_version() {
        let mut record = NameRecord::new("n1", node_set([1]), values("a"), 60);
        record.active_version = Version::new(3);
        record.old_active_version = Version::new(2);
        record.old_values = values("prev");
        let records = table_with(record).await;

        let t = records
            .delete_old_state("n1", Version::INITIAL)
            .await
            .expect("delete");
        assert_eq!(t, Transition::NotApplied(SkipReason::Duplicate));
        let r = records.get("n1").await.expect("get");
        assert_eq!(r.old_values, values("prev"));
    }

    #[tokio::test]
    async fn test_install_on_fresh_node_and_on_still_serving_node() {
        let store = Rc::new(InMemoryRecordStore::new());
        let records = NameRecords::new(store);

        let t = records
            .install_generation("n1", &node_set([1]), Version::new(2), values("a"), 30)
            .await
            .expect("install");
        assert_eq!(t, Transition::Applied);
        let r = records.get("n1").await.expect("get");
        assert_eq!(r.active_version, Version::new(2));
        assert_eq!(r.time_to_live, 30);

        let t = records
            .install_generation("n1", &node_set([1]), Version::new(3), values("b"), 30)
            .await
            .expect("install");
        assert!(matches!(
            t,
            Transition::NotApplied(SkipReason::StaleVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_old_values_on_version_match() {
        let records = table_with(NameRecord::new("n1", node_set([1]), values("a"), 60)).await;
        assert!(records
            .old_values_on_version_match("n1", Version::INITIAL)
            .await
            .expect("read")
            .is_none());

        records.retire_active("n1", Version::INITIAL).await.expect("retire");
        let (old, ttl) = records
            .old_values_on_version_match("n1", Version::INITIAL)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(old, values("a"));
        assert_eq!(ttl, 60);
    }
}
