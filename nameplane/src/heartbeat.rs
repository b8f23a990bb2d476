//! Keep-alive tracking between controllers and active groups.
//!
//! Every active replica periodically sends a [`KeepAlive`] packet to the
//! controllers of each name it serves, and every controller sends one to
//! the current active group. The receiver records the time of the last
//! keep-alive per name and reports names that went silent.
//!
//! ```text
//! Active (n1-2)                  Controller
//!   │── KeepAlive(n1, n1-2) ──────>│  every `interval`
//!   │── KeepAlive(n1, n1-2) ──────>│
//!   │    ✗ (group goes silent)     │
//!   │                              │  ... `timeout` elapses ...
//!   │                              │  → n1 surfaced as suspected
//! ```
//!
//! A keep-alive carries the group id of its sender. Keep-alives from a
//! generation other than the tracked one are stale and ignored.
//!
//! Time is passed in as a `Duration` since an arbitrary epoch, so the same
//! tracker works with wall clock time and with simulated time.
//!
//! [`KeepAlive`]: crate::packet::KeepAlive

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::types::GroupId;

/// Keep-alive timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// How often keep-alives are sent.
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,

    /// Silence after which a name is suspected. Must exceed twice the
    /// interval so one lost keep-alive is tolerated.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

impl KeepAliveConfig {
    /// Short timings for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone)]
struct Watch {
    group: GroupId,
    last_seen: Duration,
}

/// Last keep-alive time per name.
#[derive(Debug, Clone, Default)]
pub struct KeepAliveTracker {
    config: KeepAliveConfig,
    watches: BTreeMap<String, Watch>,
}

impl KeepAliveTracker {
    /// Create an empty tracker.
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            watches: BTreeMap::new(),
        }
    }

    /// Start (or restart) watching `name`, served by `group`, as of `now`.
    pub fn watch(&mut self, name: &str, group: GroupId, now: Duration) {
        self.watches.insert(
            name.to_string(),
            Watch {
                group,
                last_seen: now,
            },
        );
    }

    /// Stop watching `name`.
    pub fn unwatch(&mut self, name: &str) {
        self.watches.remove(name);
    }

    /// Group currently watched for `name`.
    pub fn watched_group(&self, name: &str) -> Option<&GroupId> {
        self.watches.get(name).map(|w| &w.group)
    }

    /// Record a keep-alive for `name` from `group`.
    ///
    /// Returns `false` if the name is not watched or the keep-alive comes
    /// from another group.
    pub fn record(&mut self, name: &str, group: &GroupId, now: Duration) -> bool {
        match self.watches.get_mut(name) {
            Some(watch) if &watch.group == group => {
                watch.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Names silent for longer than the timeout.
    pub fn timed_out(&self, now: Duration) -> Vec<String> {
        self.watches
            .iter()
            .filter(|(_, w)| now.saturating_sub(w.last_seen) > self.config.timeout)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Time since the last keep-alive for `name`.
    pub fn time_since_last(&self, name: &str, now: Duration) -> Option<Duration> {
        self.watches
            .get(name)
            .map(|w| now.saturating_sub(w.last_seen))
    }

    /// Timing in use.
    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }
}
