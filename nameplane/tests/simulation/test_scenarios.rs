//! Simulation scenarios.
//!
//! ## Test Organization
//!
//! - group change: the happy path and its intermediate states
//! - races: concurrent proposals, replayed inputs, late garbage collection
//! - faults: lossy reordering network, crashes, restarts from disk,
//!   ambiguous store writes, malformed frames
//! - lifecycle: removal and load-driven placement

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use nameplane::packet::{ReconfigPacket, StopRequest};
use nameplane::record::Transition;
use nameplane::sim::{invariants, SimCluster};
use nameplane::types::node_set;
use nameplane::{
    Collaborators, ControllerRecord, FileRecordStore, FixedControllers, LocalBus, LocalConsensus,
    NameRecord, NameServer, NodeConfig, NodeId, ReconfigConfig, ReconfigError, RecordStore,
    RequestId, SkipReason, Version,
};

use super::invariants::{all_with_committed, all_with_values};
use super::workloads::{
    commit_update, deliver_everything_twice, register_names, serving, values, MAX_STEPS,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

fn fixed_cluster() -> SimCluster {
    SimCluster::builder()
        .controllers(node_set([1, 2, 3]))
        .build()
        .expect("cluster")
}

// ============================================================================
// Group change
// ============================================================================

/// A name moves from its controllers to three other nodes, passing through
/// the stopping state, and ends with the old members' state collected.
#[tokio::test]
async fn test_group_change_moves_name_to_new_actives() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = all_with_values(registered.clone());

    let transition = cluster
        .propose("n1", node_set([4, 5, 6]))
        .await
        .expect("propose");
    assert_eq!(transition, Transition::Applied);

    while cluster
        .controller_record(NodeId(1), "n1")
        .expect("record")
        .active_running
    {
        assert!(cluster.step().await.expect("step"), "change never started");
    }
    let stopping = cluster.controller_record(NodeId(1), "n1").expect("record");
    assert_eq!(stopping.active_version, Version::new(2));
    assert_eq!(stopping.old_active_version, Version::INITIAL);
    assert_eq!(stopping.active_replicas, node_set([4, 5, 6]));
    assert_eq!(stopping.old_active_replicas, node_set([1, 2, 3]));

    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");

    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_version, Version::new(2));
    assert_eq!(record.active_replicas, node_set([4, 5, 6]));
    assert_eq!(serving(&cluster, "n1"), vec![NodeId(4), NodeId(5), NodeId(6)]);

    for id in [1, 2, 3] {
        let old = cluster.name_record(NodeId(id), "n1").expect("record");
        assert!(old.active_version.is_zero());
        assert!(old.old_active_version.is_zero(), "old state kept on {}", id);
        assert!(old.old_values.is_empty());
    }

    let new_member = cluster.server(NodeId(5)).expect("up");
    assert_eq!(
        new_member.active().lookup("n1").await.expect("lookup"),
        registered["n1"]
    );
    let old_member = cluster.server(NodeId(1)).expect("up");
    assert!(matches!(
        old_member.active().lookup("n1").await,
        Err(ReconfigError::StaleGroupReference { .. })
    ));
}

/// Values updated by the running generation are the ones the next
/// generation serves, across two consecutive changes.
#[tokio::test]
async fn test_updated_values_survive_reconfiguration() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let committed = Rc::new(RefCell::new(registered));
    let mut checkers = all_with_committed(committed.clone());

    let written = commit_update(&cluster, &committed, "n1", values("198.51.100.9"))
        .await
        .expect("update v1");
    assert_eq!(written, Version::INITIAL);
    cluster
        .propose("n1", node_set([4, 5, 6]))
        .await
        .expect("propose");
    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");
    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_version, Version::new(2));
    for id in [4, 5, 6] {
        let server = cluster.server(NodeId(id)).expect("server");
        let served = server.active().lookup("n1").await.expect("lookup");
        assert_eq!(served, values("198.51.100.9"));
    }

    commit_update(&cluster, &committed, "n1", values("198.51.100.10"))
        .await
        .expect("update v2");
    cluster
        .propose("n1", node_set([1, 2, 3]))
        .await
        .expect("propose");
    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");
    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_version, Version::new(3));
    for id in [1, 2, 3] {
        let server = cluster.server(NodeId(id)).expect("server");
        let served = server.active().lookup("n1").await.expect("lookup");
        assert_eq!(served, values("198.51.100.10"));
    }
}

// ============================================================================
// Races
// ============================================================================

/// Two controllers propose different sets for the same generation; the
/// first decided wins and the other proposer never drives anything.
#[tokio::test]
async fn test_concurrent_proposals_only_one_wins() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = all_with_values(registered);

    cluster
        .propose_via(NodeId(1), "n1", node_set([4, 5, 6]))
        .await
        .expect("first proposal");
    cluster
        .propose_via(NodeId(2), "n1", node_set([3, 4, 5]))
        .await
        .expect("second proposal");
    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");

    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_version, Version::new(2));
    assert_eq!(record.active_replicas, node_set([4, 5, 6]));
    for id in [1, 2, 3] {
        let controller = cluster.server(NodeId(id)).expect("up").controller();
        assert_eq!(controller.pending_tasks(), 0, "tasks left on {}", id);
    }
}

/// Every decision and every packet delivered twice leaves the same result
/// as a single delivery.
#[tokio::test]
async fn test_replayed_inputs_change_nothing() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = all_with_values(registered);

    cluster
        .propose("n1", node_set([3, 4, 5]))
        .await
        .expect("propose");
    let batches = deliver_everything_twice(&cluster).await.expect("deliver");
    assert!(batches > 0);
    cluster.check(&mut checkers).expect("no violation");

    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_version, Version::new(2));
    assert_eq!(record.active_replicas, node_set([3, 4, 5]));
    assert_eq!(serving(&cluster, "n1"), vec![NodeId(3), NodeId(4), NodeId(5)]);
    for id in [1, 2, 3] {
        let controller = cluster.server(NodeId(id)).expect("up").controller();
        let record = controller.records().get("n1").await.expect("record");
        assert_eq!(record.active_version, Version::new(2));
        assert!(record.active_running);
    }
}

/// A delete for an older generation arriving late must not erase values
/// retired by a newer stop: the next group still copies them.
#[tokio::test]
async fn test_late_delete_keeps_newer_retired_values() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = all_with_values(registered.clone());

    cluster
        .propose("n1", node_set([4, 5, 6]))
        .await
        .expect("first change");
    cluster.settle(2, MAX_STEPS).await.expect("settle");
    cluster.assert_converged("n1").expect("first change converged");

    cluster
        .propose("n1", node_set([1, 2, 3]))
        .await
        .expect("second change");
    while cluster
        .name_record(NodeId(4), "n1")
        .expect("record")
        .old_active_version
        != Version::new(2)
    {
        assert!(cluster.step().await.expect("step"), "node 4 never retired v2");
    }

    let late = ReconfigPacket::DeleteOldActiveState(StopRequest {
        name: "n1".to_string(),
        request_id: RequestId::compose(NodeId(1), 0),
        primary_sender: NodeId(1),
        active_receiver: NodeId(4),
        version: Version::INITIAL,
    });
    let frame = nameplane::wire::encode_packet(&late).expect("encode");
    let now = cluster.now();
    cluster
        .server(NodeId(4))
        .expect("up")
        .handle_frame(&frame, now)
        .await
        .expect("late delete handled");

    let retired = cluster.name_record(NodeId(4), "n1").expect("record");
    assert_eq!(retired.old_active_version, Version::new(2));
    assert_eq!(retired.old_values, registered["n1"]);

    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");
    cluster.settle(2, MAX_STEPS).await.expect("settle");
    let record = cluster.assert_converged("n1").expect("second change converged");
    assert_eq!(record.active_version, Version::new(3));
    assert_eq!(record.active_replicas, node_set([1, 2, 3]));
}

// ============================================================================
// Faults
// ============================================================================

/// Reordered and lossy delivery over several seeds: safety holds after
/// every step and every name converges once retries run.
#[tokio::test]
async fn test_lossy_reordered_network_converges() {
    init_tracing();
    let targets = [
        ("alpha", node_set([1, 3, 5])),
        ("beta", node_set([2, 4, 6])),
        ("gamma", node_set([1, 2, 6])),
    ];
    for seed in 0..4 {
        let mut cluster = SimCluster::builder()
            .nodes(6)
            .seed(seed)
            .reorder(true)
            .drop_probability(0.05)
            .build()
            .expect("cluster");
        let registered = register_names(&mut cluster, &["alpha", "beta", "gamma"])
            .await
            .expect("register");
        let mut checkers = all_with_values(registered);

        for (name, actives) in &targets {
            cluster
                .propose(name, actives.clone())
                .await
                .expect("propose");
        }
        let period = cluster.config().retry_timeout;
        for _ in 0..cluster.config().max_retries {
            cluster
                .run_checked(MAX_STEPS, &mut checkers)
                .await
                .unwrap_or_else(|err| panic!("seed {}: {}", seed, err));
            cluster.advance(period).await.expect("tick");
        }
        cluster
            .run_checked(MAX_STEPS, &mut checkers)
            .await
            .unwrap_or_else(|err| panic!("seed {}: {}", seed, err));

        for (name, actives) in &targets {
            let record = cluster
                .assert_converged(name)
                .unwrap_or_else(|err| panic!("seed {}: {}", seed, err));
            assert_eq!(record.active_version, Version::new(2), "seed {}", seed);
            assert_eq!(&record.active_replicas, actives, "seed {}", seed);
        }
    }
}

/// The proposer crashes right after proposing. Nothing moves while it is
/// down; after restart it replays the decided proposal and finishes.
#[tokio::test]
async fn test_crashed_proposer_resumes_change() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = all_with_values(registered);

    cluster
        .propose_via(NodeId(1), "n1", node_set([4, 5, 6]))
        .await
        .expect("propose");
    cluster.crash(NodeId(1));
    cluster.settle(5, MAX_STEPS).await.expect("settle while down");
    cluster.check(&mut checkers).expect("no violation");

    let stalled = cluster.controller_record(NodeId(2), "n1").expect("record");
    assert!(!stalled.active_running);
    assert_eq!(stalled.active_version, Version::new(2));
    assert!(cluster.name_record(NodeId(4), "n1").is_none());

    cluster.restart(NodeId(1)).await.expect("restart");
    let rounds = cluster.config().max_retries as usize;
    cluster.settle(rounds, MAX_STEPS).await.expect("settle");
    cluster.check(&mut checkers).expect("no violation");

    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_version, Version::new(2));
    assert_eq!(record.active_replicas, node_set([4, 5, 6]));
}

async fn open_server(
    dir: &std::path::Path,
    consensus: Rc<LocalConsensus>,
    bus: Rc<LocalBus>,
    nodes: Rc<NodeConfig>,
) -> NameServer {
    let controller_store: Rc<dyn RecordStore<ControllerRecord>> = Rc::new(
        FileRecordStore::<ControllerRecord>::open(dir.join("controller.json"))
            .await
            .expect("controller store"),
    );
    let name_store: Rc<dyn RecordStore<NameRecord>> = Rc::new(
        FileRecordStore::<NameRecord>::open(dir.join("names.json"))
            .await
            .expect("name store"),
    );
    let collaborators = Collaborators {
        nodes,
        controllers: Rc::new(FixedControllers(node_set([1]))),
        consensus,
        sink: bus,
    };
    NameServer::new(
        NodeId(1),
        ReconfigConfig::for_simulation(),
        collaborators,
        controller_store,
        name_store,
    )
}

async fn pump(server: &NameServer, consensus: &LocalConsensus, bus: &LocalBus, now: Duration) {
    loop {
        let decisions = consensus.drain();
        let envelopes = bus.drain();
        if decisions.is_empty() && envelopes.is_empty() {
            return;
        }
        for decision in &decisions {
            server
                .handle_decision(decision, now)
                .await
                .expect("decision");
        }
        for envelope in &envelopes {
            assert_eq!(envelope.to, NodeId(1));
            server
                .handle_frame(&envelope.frame, now)
                .await
                .expect("frame");
        }
    }
}

/// A single-node directory on file stores survives restarts before and
/// after a group change.
#[tokio::test]
async fn test_restart_from_disk_keeps_records() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let nodes = Rc::new(
        NodeConfig::builder()
            .node(1, "127.0.0.1", 7001)
            .latency(1, 1)
            .build()
            .expect("nodes"),
    );
    let consensus = Rc::new(LocalConsensus::new());
    let bus = Rc::new(LocalBus::new(nodes.clone()));
    let now = Duration::ZERO;

    let server = open_server(dir.path(), consensus.clone(), bus.clone(), nodes.clone()).await;
    assert!(server
        .register("n1", values("192.0.2.7"), 30, now)
        .await
        .expect("register"));
    drop(server);

    let server = open_server(dir.path(), consensus.clone(), bus.clone(), nodes.clone()).await;
    server.recover(now).await.expect("recover");
    assert_eq!(
        server.active().lookup("n1").await.expect("lookup"),
        values("192.0.2.7")
    );

    let transition = server
        .propose_new_actives("n1", node_set([1]))
        .await
        .expect("propose");
    assert_eq!(transition, Transition::Applied);
    pump(&server, &consensus, &bus, now).await;
    drop(server);

    let server = open_server(dir.path(), consensus.clone(), bus.clone(), nodes).await;
    server.recover(now).await.expect("recover");
    let controller = server.controller().records().get("n1").await.expect("record");
    assert_eq!(controller.active_version, Version::new(2));
    assert!(controller.active_running);
    assert_eq!(server.controller().pending_tasks(), 0);

    let name = server.active().records().get("n1").await.expect("record");
    assert_eq!(name.active_version, Version::new(2));
    assert!(name.old_active_version.is_zero());
    assert_eq!(name.values, values("192.0.2.7"));
}

/// Every fifth conditional write fails ambiguously, landed or not. Safety
/// must hold throughout and both changes must complete.
#[tokio::test]
async fn test_ambiguous_writes_keep_safety() {
    init_tracing();
    let mut cluster = SimCluster::builder()
        .controllers(node_set([1, 2, 3]))
        .flaky_writes(5)
        .seed(3)
        .build()
        .expect("cluster");
    let registered = register_names(&mut cluster, &["n1", "n2"])
        .await
        .expect("register");
    let mut checkers = all_with_values(registered);

    cluster
        .propose("n1", node_set([4, 5, 6]))
        .await
        .expect("propose n1");
    cluster
        .propose("n2", node_set([2, 4, 6]))
        .await
        .expect("propose n2");
    settle_checked(&mut cluster, &mut checkers).await;

    let n1 = cluster.assert_converged("n1").expect("n1 converged");
    assert_eq!(n1.active_replicas, node_set([4, 5, 6]));
    let n2 = cluster.assert_converged("n2").expect("n2 converged");
    assert_eq!(n2.active_replicas, node_set([2, 4, 6]));
}

/// Back-to-back changes of one name under frequent ambiguous writes. A
/// write reported as failed that did not land is reissued, so no change
/// is left half done.
#[tokio::test]
async fn test_back_to_back_changes_survive_lost_writes() {
    init_tracing();
    let targets = [node_set([4, 5, 6]), node_set([2, 3, 5]), node_set([1, 2, 6])];
    for every in [2, 3] {
        for seed in 0..5 {
            let mut cluster = SimCluster::builder()
                .controllers(node_set([1, 2, 3]))
                .flaky_writes(every)
                .seed(seed)
                .build()
                .expect("cluster");
            let registered = register_names(&mut cluster, &["n1"])
                .await
                .expect("register");
            let mut checkers = all_with_values(registered);

            for (i, target) in targets.iter().enumerate() {
                let t = cluster
                    .propose("n1", target.clone())
                    .await
                    .expect("propose");
                assert_eq!(t, Transition::Applied, "every={} seed={}", every, seed);
                settle_checked(&mut cluster, &mut checkers).await;
                let record = cluster
                    .assert_converged("n1")
                    .unwrap_or_else(|e| panic!("every={} seed={}: {}", every, seed, e));
                assert_eq!(&record.active_replicas, target);
                assert_eq!(record.active_version, Version::new(i as u32 + 2));
            }
        }
    }
}

async fn settle_checked(
    cluster: &mut SimCluster,
    checkers: &mut [Box<dyn invariants::Invariant>],
) {
    let period = cluster.config().retry_timeout;
    for _ in 0..cluster.config().max_retries {
        cluster
            .run_checked(MAX_STEPS, checkers)
            .await
            .expect("no violation");
        cluster.advance(period).await.expect("tick");
    }
    cluster
        .run_checked(MAX_STEPS, checkers)
        .await
        .expect("no violation");
}

/// Garbage on the wire is dropped without touching any record.
#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = all_with_values(registered);

    let garbage: [&'static [u8]; 5] = [
        b"",
        b"garbage",
        b"12:{\"type\":2}",
        b"11:{\"type\":99}",
        b"4:[1]",
    ];
    for id in [1, 4] {
        for frame in garbage {
            cluster.inject(NodeId(id), Bytes::from_static(frame));
        }
    }
    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");
    assert_eq!(cluster.stats().errors, 0);
    assert_eq!(cluster.stats().delivered, 10);

    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_version, Version::INITIAL);
    assert!(cluster.name_record(NodeId(4), "n1").is_none());
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Removal of a reconfigured name deletes its controller records and the
/// records of its current generation; other names are untouched.
#[tokio::test]
async fn test_removal_cleans_every_record() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1", "n2"])
        .await
        .expect("register");
    let mut checkers = all_with_values(registered);

    cluster
        .propose("n2", node_set([4, 5, 6]))
        .await
        .expect("propose");
    cluster.settle(2, MAX_STEPS).await.expect("settle");
    cluster.assert_converged("n2").expect("converged");

    let transition = cluster.request_removal("n2").await.expect("removal");
    assert_eq!(transition, Transition::Applied);
    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");
    cluster.settle(2, MAX_STEPS).await.expect("settle");

    for id in [1, 2, 3] {
        assert!(cluster.controller_record(NodeId(id), "n2").is_none());
    }
    for id in [4, 5, 6] {
        assert!(cluster.name_record(NodeId(id), "n2").is_none());
    }
    assert!(serving(&cluster, "n2").is_empty());
    assert!(cluster.propose("n2", node_set([1, 2, 3])).await.is_err());
    cluster.assert_converged("n1").expect("n1 untouched");
}

/// Lookup votes for three other nodes make the lowest controller move the
/// name there; without new load the policy keeps the group.
#[tokio::test]
async fn test_votes_drive_placement() {
    init_tracing();
    let mut cluster = fixed_cluster();
    let registered = register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = all_with_values(registered);

    {
        let controller = cluster.server(NodeId(1)).expect("up").controller();
        for node in [4, 5, 6] {
            for _ in 0..20 {
                controller
                    .record_vote("n1", NodeId(node), 1, false)
                    .await
                    .expect("vote");
            }
        }
    }
    let other = cluster
        .server(NodeId(2))
        .expect("up")
        .controller()
        .compute_new_actives("n1")
        .await
        .expect("compute on 2");
    assert_eq!(other, Transition::NotApplied(SkipReason::NotMember));

    let transition = cluster.compute_new_actives("n1").await.expect("compute");
    assert_eq!(transition, Transition::Applied);
    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");
    cluster.settle(2, MAX_STEPS).await.expect("settle");

    let record = cluster.assert_converged("n1").expect("converged");
    assert_eq!(record.active_replicas, node_set([4, 5, 6]));
    assert_eq!(record.active_version, Version::new(2));

    let again = cluster.compute_new_actives("n1").await.expect("compute");
    assert_eq!(again, Transition::NotApplied(SkipReason::Unchanged));
}

/// The standard checkers on their own accept a plain change.
#[tokio::test]
async fn test_standard_checkers_accept_plain_change() {
    init_tracing();
    let mut cluster = fixed_cluster();
    register_names(&mut cluster, &["n1"]).await.expect("register");
    let mut checkers = invariants::all();
    cluster
        .propose("n1", node_set([2, 4, 6]))
        .await
        .expect("propose");
    cluster
        .run_checked(MAX_STEPS, &mut checkers)
        .await
        .expect("no violation");
    cluster.assert_converged("n1").expect("converged");
}
