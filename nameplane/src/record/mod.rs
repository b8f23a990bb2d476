//! Versioned record model.
//!
//! Two records exist per registered name:
//!
//! - [`NameRecord`], held by active replicas: the name's current values
//!   tagged with the generation that owns them, plus the values captured
//!   when the previous generation was retired.
//! - [`ControllerRecord`], held by replica controllers: which node set is
//!   active at which generation, whether it is running, and load statistics.
//!
//! Per name, the pair moves through:
//!
//! ```text
//! STEADY(v) ──propose──> STOPPING(v, v+1) ──stop──> TRANSFERRING(v, v+1) ──start──> STEADY(v+1)
//!   running=true          running=false               old group retired            running=true
//! ```
//!
//! Each arrow is a conditional write. Repeating an arrow is a no-op that
//! reports [`Transition::NotApplied`].

mod controller_record;
mod moving_average;
mod name_record;

pub use controller_record::{
    ControllerField, ControllerRecord, ControllerRecords, ControllerUpdate, NodeStats,
    RemovalMark,
};
pub use moving_average::MovingAverage;
pub use name_record::{NameField, NameRecord, NameRecords, NameUpdate, VersionStatus};

use tracing::warn;

use crate::error::StoreError;
use crate::store::{Condition, Record, RecordStore};
use crate::types::Version;

/// Conditional writes reissued after ambiguous failures before giving up.
const AMBIGUOUS_WRITE_ATTEMPTS: u32 = 5;

/// Outcome of a state transition attempted through a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transition happened now.
    Applied,
    /// Nothing changed.
    NotApplied(SkipReason),
}

impl Transition {
    /// Whether the transition happened.
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Why a transition was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The transition was already applied earlier.
    Duplicate,
    /// Another transition is in progress for the name.
    InProgress,
    /// The name is being removed.
    MarkedForRemoval,
    /// The request refers to a generation other than the record's.
    StaleVersion {
        /// Generation in the record.
        current: Version,
        /// Generation in the request.
        requested: Version,
    },
    /// The request targets a generation that has already been stopped.
    GenerationStopped(Version),
    /// The conditional write lost against a concurrent writer.
    ConditionFailed,
    /// This node is not a member of the targeted group.
    NotMember,
    /// Nothing to do.
    Unchanged,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => f.write_str("already applied"),
            Self::InProgress => f.write_str("reconfiguration in progress"),
            Self::MarkedForRemoval => f.write_str("marked for removal"),
            Self::StaleVersion { current, requested } => {
                write!(f, "stale version {} (record at {})", requested, current)
            }
            Self::GenerationStopped(v) => write!(f, "generation {} stopped", v),
            Self::ConditionFailed => f.write_str("condition failed"),
            Self::NotMember => f.write_str("not a member"),
            Self::Unchanged => f.write_str("unchanged"),
        }
    }
}

fn applied_or(applied: bool, reason: SkipReason) -> Transition {
    if applied {
        Transition::Applied
    } else {
        Transition::NotApplied(reason)
    }
}

/// Conditional write whose ambiguous outcomes are settled by re-reading.
///
/// On [`StoreError::Unavailable`] the record is read back. `landed` tells
/// whether the write took effect. If it did not and `condition` still
/// holds, nobody raced us and the write is issued again. `Ok(false)` means
/// the condition no longer holds.
pub(crate) async fn write_resolved<R: Record>(
    store: &dyn RecordStore<R>,
    key: &str,
    condition: &Condition<R::Field>,
    updates: &[R::Update],
    landed: impl Fn(&R) -> bool,
) -> Result<bool, StoreError> {
    for attempt in 1..=AMBIGUOUS_WRITE_ATTEMPTS {
        let reason = match store.write_if(key, condition, updates).await {
            Err(StoreError::Unavailable(reason)) => reason,
            other => return other,
        };
        let record = store.get(key).await?;
        if landed(&record) {
            return Ok(true);
        }
        if !condition.holds(&record) {
            return Ok(false);
        }
        warn!(key = %key, attempt, reason = %reason, "ambiguous write did not land, reissuing");
    }
    Err(StoreError::Unavailable(format!(
        "write on {} unresolved after {} attempts",
        key, AMBIGUOUS_WRITE_ATTEMPTS
    )))
}
