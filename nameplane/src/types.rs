//! Core identifiers shared by records, packets and the protocol roles.
//!
//! - [`NodeId`]: small integer naming a name server in the static node table
//! - [`NodeSet`]: ordered set of node ids (a replica group)
//! - [`Version`]: generation number of an active replica group
//! - [`GroupId`]: consensus group identifier derived from a name
//! - [`RequestId`]: correlation id matching replies to outstanding requests

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Identifier of a name server.
///
/// Node ids are resolved to `host:port` through
/// [`NodeConfig`](crate::config::NodeConfig).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a node id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node({})", self.0)
    }
}

/// Ordered set of nodes. Iteration order is ascending node id.
pub type NodeSet = BTreeSet<NodeId>;

/// Build a [`NodeSet`] from raw ids.
pub fn node_set(ids: impl IntoIterator<Item = u32>) -> NodeSet {
    ids.into_iter().map(NodeId).collect()
}

/// Current values of a name: record key to list of values.
pub type ValuesMap = BTreeMap<String, Vec<String>>;

/// Generation number of an active replica group.
///
/// Every reconfiguration installs the next version. [`Version::ZERO`] is the
/// "no generation" sentinel: a name record whose active version is zero has
/// retired its generation and not yet installed a new one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u32);

impl Version {
    /// The "no generation" sentinel.
    pub const ZERO: Self = Self(0);

    /// Generation assigned when a name is registered.
    pub const INITIAL: Self = Self(1);

    /// Create a version.
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// The next generation.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the sentinel.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifier of a consensus group.
///
/// Active groups are named after the name and generation they serve, so a
/// group created for `n1` at version 2 is distinct from the one at version 3.
/// The controller group of a name has a single id for its whole life.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Group of the active replicas serving `name` at `version`.
    pub fn for_actives(name: &str, version: Version) -> Self {
        Self(format!("{}-{}", name, version.0))
    }

    /// Group of the replica controllers owning `name`.
    pub fn for_controllers(name: &str) -> Self {
        Self(format!("{}-RC", name))
    }

    /// The raw group id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id of an outstanding request.
///
/// Composed of the issuing node id (high 32 bits) and a per-node sequence
/// number, so ids from different controllers never collide.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Compose a request id from its issuer and sequence number.
    pub const fn compose(issuer: NodeId, seq: u32) -> Self {
        Self(((issuer.0 as u64) << 32) | seq as u64)
    }

    /// The node that issued this request.
    pub const fn issuer(self) -> NodeId {
        NodeId((self.0 >> 32) as u32)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req({}:{})", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Serde adapter writing node sets as colon-joined integers (`"3:7:12"`).
///
/// Use with `#[serde(with = "crate::types::colon_set")]`.
pub mod colon_set {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use super::{NodeId, NodeSet};

    /// Render a node set as `"3:7:12"`. The empty set renders as `""`.
    pub fn format(set: &NodeSet) -> String {
        set.iter()
            .map(|id| id.0.to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Parse a colon-joined node list.
    pub fn parse(raw: &str) -> Result<NodeSet, String> {
        if raw.trim().is_empty() {
            return Ok(NodeSet::new());
        }
        raw.split(':')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map(NodeId)
                    .map_err(|_| format!("invalid node id {:?} in {:?}", part, raw))
            })
            .collect()
    }

    #[allow(missing_docs)]
    pub fn serialize<S: Serializer>(set: &NodeSet, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(set))
    }

    #[allow(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NodeSet, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }
}
