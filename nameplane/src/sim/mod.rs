//! Deterministic in-process cluster.
//!
//! A [`SimCluster`] runs every node of a directory on one thread over a
//! shared [`LocalConsensus`] and [`LocalBus`]. Each [`SimCluster::step`]
//! delivers exactly one queued consensus decision or one framed packet,
//! picked by a seeded `ChaCha8Rng`, so a seed replays the same interleaving.
//!
//! ```text
//!             ┌──────────── LocalBus (framed packets) ────────────┐
//!             │                                                   │
//! ┌───────────▼──┐   ┌──────────────┐          ┌──────────────┐   │
//! │ NameServer 1 │   │ NameServer 2 │   ...    │ NameServer n │───┘
//! └───────────▲──┘   └──────▲───────┘          └──────▲───────┘
//!             │             │                         │
//!             └───── LocalConsensus (decisions) ──────┘
//! ```
//!
//! Faults:
//! - packet reordering and loss, per builder settings
//! - node crash and restart: records survive in the node's stores, queued
//!   decisions for a crashed node are replayed when it restarts, in-memory
//!   protocol state is lost
//! - ambiguous store writes through [`FlakyStore`]

mod flaky;
pub mod invariants;

pub use flaky::FlakyStore;

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, ReconfigConfig};
use crate::consensus::{Decision, LocalConsensus};
use crate::error::{ConfigError, ReconfigError};
use crate::hashing::{FixedControllers, HashRing, ReplicaControllerSet};
use crate::node::{Collaborators, NameServer, TickReport};
use crate::record::{ControllerRecord, NameRecord, Transition};
use crate::store::{InMemoryRecordStore, RecordStore};
use crate::transport::LocalBus;
use crate::types::{NodeId, NodeSet, ValuesMap};

use self::invariants::Invariant;

/// Simulation failures.
#[derive(Debug, Error)]
pub enum SimError {
    /// An invariant checker reported a violation.
    #[error("Invariant {name} violated: {reason}")]
    InvariantViolated {
        /// Checker name.
        name: String,
        /// What was observed.
        reason: String,
    },

    /// Messages were still in flight after the step budget.
    #[error("Not quiescent after {steps} steps")]
    NotQuiescent {
        /// Steps taken.
        steps: usize,
    },

    /// A name did not reach a stable generation.
    #[error("Name {name} did not converge: {reason}")]
    NotConverged {
        /// The name.
        name: String,
        /// What was observed.
        reason: String,
    },

    /// The node is crashed or unknown.
    #[error("Node down: {0}")]
    NodeDown(NodeId),

    /// No live controller for the name.
    #[error("No live controller for {0}")]
    NoController(String),

    /// The node table is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A protocol operation failed.
    #[error("Reconfiguration error: {0}")]
    Reconfig(#[from] ReconfigError),
}

struct SimNode {
    server: Option<NameServer>,
    controller_store: Rc<InMemoryRecordStore<ControllerRecord>>,
    name_store: Rc<InMemoryRecordStore<NameRecord>>,
    flaky_every: u32,
}

/// Builder for [`SimCluster`].
#[derive(Debug, Clone)]
pub struct SimClusterBuilder {
    node_count: u32,
    controllers: Option<NodeSet>,
    seed: u64,
    reorder: bool,
    drop_probability: f64,
    flaky_every: u32,
    config: ReconfigConfig,
}

impl Default for SimClusterBuilder {
    fn default() -> Self {
        Self {
            node_count: 6,
            controllers: None,
            seed: 0,
            reorder: false,
            drop_probability: 0.0,
            flaky_every: 0,
            config: ReconfigConfig::for_simulation(),
        }
    }
}

impl SimClusterBuilder {
    /// Nodes `1..=count`.
    pub fn nodes(mut self, count: u32) -> Self {
        self.node_count = count;
        self
    }

    /// Use the same controllers for every name instead of a hash ring of
    /// three.
    pub fn controllers(mut self, controllers: NodeSet) -> Self {
        self.controllers = Some(controllers);
        self
    }

    /// Seed of the scheduler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Deliver queued packets in random order.
    pub fn reorder(mut self, reorder: bool) -> Self {
        self.reorder = reorder;
        self
    }

    /// Lose each packet with probability `p`.
    pub fn drop_probability(mut self, p: f64) -> Self {
        self.drop_probability = p.clamp(0.0, 1.0);
        self
    }

    /// Make every `every`-th conditional write of every store ambiguous.
    pub fn flaky_writes(mut self, every: u32) -> Self {
        self.flaky_every = every;
        self
    }

    /// Protocol tuning.
    pub fn config(mut self, config: ReconfigConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the cluster with every node up.
    pub fn build(self) -> Result<SimCluster, SimError> {
        let mut table = NodeConfig::builder();
        for id in 1..=self.node_count {
            table = table
                .node(id, format!("10.0.0.{}", id), 7000)
                .latency(id, u64::from(id));
        }
        let nodes = Rc::new(table.build()?);
        let placement: Rc<dyn ReplicaControllerSet> = match self.controllers {
            Some(set) => Rc::new(FixedControllers(set)),
            None => Rc::new(HashRing::new(&nodes.node_ids(), 3)),
        };
        let consensus = Rc::new(LocalConsensus::new());
        let bus = Rc::new(LocalBus::new(nodes.clone()));

        let mut cluster = SimCluster {
            config: self.config,
            nodes,
            placement,
            consensus,
            bus,
            members: BTreeMap::new(),
            backlog: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(self.seed),
            reorder: self.reorder,
            drop_probability: self.drop_probability,
            now: Duration::ZERO,
            stats: SimStats::default(),
        };
        for id in cluster.nodes.node_ids() {
            let mut node = SimNode {
                server: None,
                controller_store: Rc::new(InMemoryRecordStore::new()),
                name_store: Rc::new(InMemoryRecordStore::new()),
                flaky_every: self.flaky_every,
            };
            node.server = Some(cluster.start_server(id, &node));
            cluster.members.insert(id, node);
        }
        info!(nodes = cluster.members.len(), seed = self.seed, "simulation cluster built");
        Ok(cluster)
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Packets handed to a live node.
    pub delivered: u64,
    /// Packets lost to the drop probability or a crashed receiver.
    pub dropped: u64,
    /// Decisions executed.
    pub decisions: u64,
    /// Handler errors logged and skipped.
    pub errors: u64,
}

/// A whole directory in one process.
pub struct SimCluster {
    config: ReconfigConfig,
    nodes: Rc<NodeConfig>,
    placement: Rc<dyn ReplicaControllerSet>,
    consensus: Rc<LocalConsensus>,
    bus: Rc<LocalBus>,
    members: BTreeMap<NodeId, SimNode>,
    backlog: BTreeMap<NodeId, VecDeque<Decision>>,
    rng: ChaCha8Rng,
    reorder: bool,
    drop_probability: f64,
    now: Duration,
    stats: SimStats,
}

impl SimCluster {
    /// Start building a cluster.
    pub fn builder() -> SimClusterBuilder {
        SimClusterBuilder::default()
    }

    /// Simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Protocol tuning in use.
    pub fn config(&self) -> &ReconfigConfig {
        &self.config
    }

    /// Delivery counters.
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Every node id.
    pub fn node_ids(&self) -> NodeSet {
        self.nodes.node_ids()
    }

    /// Nodes currently up.
    pub fn live_nodes(&self) -> NodeSet {
        self.members
            .iter()
            .filter(|(_, node)| node.server.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Controllers of `name`.
    pub fn controllers_for(&self, name: &str) -> NodeSet {
        self.placement.controllers_for(name)
    }

    /// Shared consensus.
    pub fn consensus(&self) -> &LocalConsensus {
        &self.consensus
    }

    /// Shared packet bus.
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    /// Server of a live node.
    pub fn server(&self, id: NodeId) -> Option<&NameServer> {
        self.members.get(&id).and_then(|node| node.server.as_ref())
    }

    /// Controller record of `name` as stored on `id`, crashed or not.
    pub fn controller_record(&self, id: NodeId, name: &str) -> Option<ControllerRecord> {
        self.members
            .get(&id)
            .and_then(|node| node.controller_store.peek(name))
    }

    /// Name record of `name` as stored on `id`, crashed or not.
    pub fn name_record(&self, id: NodeId, name: &str) -> Option<NameRecord> {
        self.members.get(&id).and_then(|node| node.name_store.peek(name))
    }

    /// Every controller record held by `id`.
    pub fn controller_records(&self, id: NodeId) -> Vec<ControllerRecord> {
        self.members
            .get(&id)
            .map(|node| node.controller_store.snapshot())
            .unwrap_or_default()
    }

    /// Every name record held by `id`.
    pub fn name_records(&self, id: NodeId) -> Vec<NameRecord> {
        self.members
            .get(&id)
            .map(|node| node.name_store.snapshot())
            .unwrap_or_default()
    }

    /// Register `name` on all of its live controllers.
    pub async fn register(
        &mut self,
        name: &str,
        values: ValuesMap,
        ttl: u32,
    ) -> Result<(), SimError> {
        for id in self.controllers_for(name) {
            let server = self.server(id).ok_or(SimError::NodeDown(id))?;
            server.register(name, values.clone(), ttl, self.now).await?;
        }
        Ok(())
    }

    /// Propose `new_actives` for `name` through its lowest live controller.
    pub async fn propose(
        &mut self,
        name: &str,
        new_actives: NodeSet,
    ) -> Result<Transition, SimError> {
        let via = self.live_controller(name)?;
        self.propose_via(via, name, new_actives).await
    }

    /// Propose `new_actives` for `name` through controller `via`.
    pub async fn propose_via(
        &mut self,
        via: NodeId,
        name: &str,
        new_actives: NodeSet,
    ) -> Result<Transition, SimError> {
        let server = self.server(via).ok_or(SimError::NodeDown(via))?;
        Ok(server.propose_new_actives(name, new_actives).await?)
    }

    /// Propose removal of `name` through its lowest live controller.
    pub async fn request_removal(&mut self, name: &str) -> Result<Transition, SimError> {
        let via = self.live_controller(name)?;
        let server = self.server(via).ok_or(SimError::NodeDown(via))?;
        Ok(server.request_removal(name).await?)
    }

    /// Run the placement policy for `name` on its controllers.
    pub async fn compute_new_actives(&mut self, name: &str) -> Result<Transition, SimError> {
        let via = self.live_controller(name)?;
        let server = self.server(via).ok_or(SimError::NodeDown(via))?;
        Ok(server.controller().compute_new_actives(name).await?)
    }

    /// Push a raw frame to `to`.
    pub fn inject(&self, to: NodeId, frame: bytes::Bytes) {
        self.bus.inject(to, frame);
    }

    /// Deliver one decision or packet. Returns `false` when nothing is
    /// queued.
    pub async fn step(&mut self) -> Result<bool, SimError> {
        let decisions = self.consensus.pending();
        let packets = self.bus.pending();
        if decisions == 0 && packets == 0 {
            return Ok(false);
        }
        let take_decision = match (decisions > 0, packets > 0) {
            (true, false) => true,
            (false, true) => false,
            _ => !self.reorder || self.rng.random_bool(0.5),
        };

        if take_decision {
            if let Some(decision) = self.consensus.pop() {
                self.execute(decision).await;
            }
            return Ok(true);
        }

        let index = if self.reorder {
            self.rng.random_range(0..packets)
        } else {
            0
        };
        let Some(envelope) = self.bus.take(index) else {
            return Ok(true);
        };
        if self.drop_probability > 0.0 && self.rng.random_bool(self.drop_probability) {
            debug!(to = %envelope.to, "packet dropped");
            self.stats.dropped += 1;
            return Ok(true);
        }
        let now = self.now;
        let Some(server) = self.server(envelope.to) else {
            debug!(to = %envelope.to, "receiver down, packet dropped");
            self.stats.dropped += 1;
            return Ok(true);
        };
        let result = server.handle_frame(&envelope.frame, now).await;
        self.stats.delivered += 1;
        self.note(envelope.to, result);
        Ok(true)
    }

    /// Step until nothing is queued.
    pub async fn run_until_quiet(&mut self, max_steps: usize) -> Result<usize, SimError> {
        let mut steps = 0;
        while self.step().await? {
            steps += 1;
            if steps >= max_steps {
                return Err(SimError::NotQuiescent { steps });
            }
        }
        Ok(steps)
    }

    /// Step until quiet, checking `invariants` after every step.
    pub async fn run_checked(
        &mut self,
        max_steps: usize,
        invariants: &mut [Box<dyn Invariant>],
    ) -> Result<usize, SimError> {
        let mut steps = 0;
        self.check(invariants)?;
        while self.step().await? {
            steps += 1;
            self.check(invariants)?;
            if steps >= max_steps {
                return Err(SimError::NotQuiescent { steps });
            }
        }
        Ok(steps)
    }

    /// Move time forward and tick every live node.
    pub async fn advance(&mut self, dt: Duration) -> Result<TickReport, SimError> {
        self.now += dt;
        let mut report = TickReport::default();
        for id in self.live_nodes() {
            if let Some(server) = self.server(id) {
                report.merge(server.tick(self.now).await?);
            }
        }
        Ok(report)
    }

    /// Alternate quiet runs and retry ticks for `rounds` retry periods.
    pub async fn settle(&mut self, rounds: usize, max_steps: usize) -> Result<(), SimError> {
        let period = self.config.retry_timeout;
        for _ in 0..rounds {
            self.run_until_quiet(max_steps).await?;
            self.advance(period).await?;
        }
        self.run_until_quiet(max_steps).await?;
        Ok(())
    }

    /// Stop `id`. Its stores survive; its in-memory protocol state is lost.
    pub fn crash(&mut self, id: NodeId) {
        if let Some(node) = self.members.get_mut(&id) {
            if node.server.take().is_some() {
                info!(node = %id, "node crashed");
            }
        }
    }

    /// Restart a crashed node: replay its missed decisions, then recover.
    pub async fn restart(&mut self, id: NodeId) -> Result<(), SimError> {
        let server = {
            let node = self.members.get(&id).ok_or(SimError::NodeDown(id))?;
            if node.server.is_some() {
                return Ok(());
            }
            self.start_server(id, node)
        };
        if let Some(node) = self.members.get_mut(&id) {
            node.server = Some(server);
        }
        info!(node = %id, "node restarted");

        let missed = self.backlog.remove(&id).unwrap_or_default();
        for decision in missed {
            self.execute(decision).await;
        }
        let now = self.now;
        if let Some(server) = self.server(id) {
            server.recover(now).await?;
        }
        Ok(())
    }

    /// Run every checker against the current state.
    pub fn check(&self, invariants: &mut [Box<dyn Invariant>]) -> Result<(), SimError> {
        for invariant in invariants.iter_mut() {
            invariant
                .check(self)
                .map_err(|reason| SimError::InvariantViolated {
                    name: invariant.name().to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Check that `name` finished its last change: every live controller
    /// agrees on a running generation, and a majority of its members serve
    /// it.
    pub fn assert_converged(&self, name: &str) -> Result<ControllerRecord, SimError> {
        let not_converged = |reason: String| SimError::NotConverged {
            name: name.to_string(),
            reason,
        };
        let mut agreed: Option<ControllerRecord> = None;
        for id in self.controllers_for(name) {
            if self.server(id).is_none() {
                continue;
            }
            let record = self
                .controller_record(id, name)
                .ok_or_else(|| not_converged(format!("no controller record on {}", id)))?;
            if !record.active_running {
                return Err(not_converged(format!("change in progress on {}", id)));
            }
            match &agreed {
                Some(first)
                    if first.active_version != record.active_version
                        || first.active_replicas != record.active_replicas =>
                {
                    return Err(not_converged(format!(
                        "controllers disagree: {} {:?} vs {} {:?}",
                        first.active_version,
                        first.active_replicas,
                        record.active_version,
                        record.active_replicas
                    )));
                }
                Some(_) => {}
                None => agreed = Some(record),
            }
        }
        let record = agreed.ok_or_else(|| not_converged("no live controller".to_string()))?;
        let serving = record
            .active_replicas
            .iter()
            .filter(|id| {
                self.name_record(**id, name)
                    .is_some_and(|r| r.active_version == record.active_version)
            })
            .count();
        if serving <= record.active_replicas.len() / 2 {
            return Err(not_converged(format!(
                "{} of {} members serve {}",
                serving,
                record.active_replicas.len(),
                record.active_version
            )));
        }
        Ok(record)
    }

    fn live_controller(&self, name: &str) -> Result<NodeId, SimError> {
        self.controllers_for(name)
            .into_iter()
            .find(|id| self.server(*id).is_some())
            .ok_or_else(|| SimError::NoController(name.to_string()))
    }

    fn start_server(&self, id: NodeId, node: &SimNode) -> NameServer {
        let collaborators = Collaborators {
            nodes: self.nodes.clone(),
            controllers: self.placement.clone(),
            consensus: self.consensus.clone(),
            sink: self.bus.clone(),
        };
        let controller_store: Rc<dyn RecordStore<ControllerRecord>> = if node.flaky_every > 0 {
            Rc::new(FlakyStore::new(node.controller_store.clone(), node.flaky_every))
        } else {
            node.controller_store.clone()
        };
        let name_store: Rc<dyn RecordStore<NameRecord>> = if node.flaky_every > 0 {
            Rc::new(FlakyStore::new(node.name_store.clone(), node.flaky_every))
        } else {
            node.name_store.clone()
        };
        NameServer::new(
            id,
            self.config.clone(),
            collaborators,
            controller_store,
            name_store,
        )
    }

    async fn execute(&mut self, decision: Decision) {
        let now = self.now;
        let member = decision.member;
        let Some(server) = self.server(member) else {
            self.backlog.entry(member).or_default().push_back(decision);
            return;
        };
        let result = server.handle_decision(&decision, now).await;
        self.stats.decisions += 1;
        self.note(member, result);
    }

    fn note(&mut self, node: NodeId, result: Result<(), ReconfigError>) {
        if let Err(err) = result {
            warn!(node = %node, error = %err, "handler failed");
            self.stats.errors += 1;
        }
    }
}
