//! Static configuration.
//!
//! - [`NodeConfig`]: the node table mapping node ids to `host:port` and the
//!   measured ping latency used by replica selection
//! - [`ReconfigConfig`]: retry, replica-count and keep-alive tuning
//!
//! The node table can be loaded from a whitespace-separated hosts file,
//! one node per line (`id host port [latencyMs]`, `#` starts a comment),
//! or from JSON. [`ReconfigConfig`] loads from JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::heartbeat::KeepAliveConfig;
use crate::types::{NodeId, NodeSet};

/// Address and measured latency of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Host name or IP.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// Ping latency in milliseconds, `None` when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_latency_ms: Option<u64>,
}

/// Static node table.
///
/// # Example
///
/// ```rust
/// use nameplane::config::NodeConfig;
/// use nameplane::types::NodeId;
///
/// let nodes = NodeConfig::builder()
///     .node(1, "10.0.0.1", 5000)
///     .latency(1, 12)
///     .build()
///     .expect("valid node table");
/// assert_eq!(nodes.address(NodeId::new(1)).as_deref(), Some("10.0.0.1:5000"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeConfig {
    nodes: BTreeMap<NodeId, NodeInfo>,
}

impl NodeConfig {
    /// Start building a node table.
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Parse the hosts file format.
    pub fn from_hosts_str(input: &str) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        for (index, raw) in input.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |reason: &str| ConfigError::InvalidLine {
                line: index + 1,
                reason: reason.to_string(),
            };
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 || parts.len() > 4 {
                return Err(invalid("expected `id host port [latencyMs]`"));
            }
            let id: u32 = parts[0].parse().map_err(|_| invalid("bad node id"))?;
            let port: u16 = parts[2].parse().map_err(|_| invalid("bad port"))?;
            builder = builder.node(id, parts[1], port);
            if let Some(latency) = parts.get(3) {
                let ms: u64 = latency.parse().map_err(|_| invalid("bad latency"))?;
                builder = builder.latency(id, ms);
            }
        }
        builder.build()
    }

    /// Parse a JSON node table (`{"1": {"host": .., "port": ..}}`).
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Load a hosts file, or a JSON table when the path ends in `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&content)
        } else {
            Self::from_hosts_str(&content)
        }
    }

    /// `host:port` of a node.
    pub fn address(&self, id: NodeId) -> Option<String> {
        self.nodes
            .get(&id)
            .map(|info| format!("{}:{}", info.host, info.port))
    }

    /// Measured ping latency of a node, `None` if unknown or not configured.
    pub fn ping_latency(&self, id: NodeId) -> Option<Duration> {
        self.nodes
            .get(&id)
            .and_then(|info| info.ping_latency_ms)
            .map(Duration::from_millis)
    }

    /// Whether the node is configured.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All configured node ids.
    pub fn node_ids(&self) -> NodeSet {
        self.nodes.keys().copied().collect()
    }

    /// Number of configured nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Clone, Default)]
pub struct NodeConfigBuilder {
    nodes: Vec<(NodeId, NodeInfo)>,
    latencies: Vec<(NodeId, u64)>,
}

impl NodeConfigBuilder {
    /// Add a node.
    pub fn node(mut self, id: u32, host: impl Into<String>, port: u16) -> Self {
        self.nodes.push((
            NodeId(id),
            NodeInfo {
                host: host.into(),
                port,
                ping_latency_ms: None,
            },
        ));
        self
    }

    /// Set the measured ping latency of a node added with [`Self::node`].
    pub fn latency(mut self, id: u32, ms: u64) -> Self {
        self.latencies.push((NodeId(id), ms));
        self
    }

    /// Build the table, rejecting duplicate ids and latencies for unknown
    /// nodes.
    pub fn build(self) -> Result<NodeConfig, ConfigError> {
        let mut nodes = BTreeMap::new();
        for (id, info) in self.nodes {
            if nodes.insert(id, info).is_some() {
                return Err(ConfigError::DuplicateNode(id));
            }
        }
        for (id, ms) in self.latencies {
            let info = nodes
                .get_mut(&id)
                .ok_or_else(|| ConfigError::Invalid(format!("latency for unknown {}", id)))?;
            info.ping_latency_ms = Some(ms);
        }
        Ok(NodeConfig { nodes })
    }
}

/// Tuning of the reconfiguration protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfigConfig {
    /// Wait before resending an unconfirmed request.
    #[serde(with = "duration_ms", rename = "retry_timeout_ms")]
    pub retry_timeout: Duration,

    /// Resends before a request is abandoned.
    pub max_retries: u32,

    /// Smallest active group a reconfiguration may install.
    pub min_replica: usize,

    /// Largest active group a reconfiguration may install.
    pub max_replica: usize,

    /// Divisor applied to the lookup/update ratio when sizing a group.
    pub normalizing_constant: f64,

    /// Samples kept by the read and write moving averages.
    pub moving_average_window: usize,

    /// Average lookups below which the active group is left unchanged.
    pub min_lookup_threshold: f64,

    /// Keep-alive timing.
    pub keep_alive: KeepAliveConfig,
}

impl Default for ReconfigConfig {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_secs(2),
            max_retries: 10,
            min_replica: 3,
            max_replica: 100,
            normalizing_constant: 0.5,
            moving_average_window: 20,
            min_lookup_threshold: 50.0,
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl ReconfigConfig {
    /// Short timings for simulated time.
    pub fn for_simulation() -> Self {
        Self {
            retry_timeout: Duration::from_millis(50),
            max_retries: 20,
            keep_alive: KeepAliveConfig::for_simulation(),
            ..Self::default()
        }
    }

    /// Parse from JSON. Missing fields take their default.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_replica == 0 || self.min_replica > self.max_replica {
            return Err(ConfigError::Invalid(format!(
                "replica bounds [{}, {}]",
                self.min_replica, self.max_replica
            )));
        }
        if self.normalizing_constant <= 0.0 {
            return Err(ConfigError::Invalid(
                "normalizing_constant must be positive".to_string(),
            ));
        }
        if self.moving_average_window == 0 {
            return Err(ConfigError::Invalid(
                "moving_average_window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter writing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
