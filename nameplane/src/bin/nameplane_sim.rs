//! Randomized reconfiguration run on a simulated directory.
//!
//! Registers a few names, then for each round proposes a random new active
//! set for a random name while packets are reordered and lost and nodes
//! crash and restart. Safety invariants are checked after every step; at
//! the end faults stop and every name must converge.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin nameplane-sim -- --seed 7 --nodes 7 --names 4 --rounds 30
//! ```
//!
//! `RUST_LOG=info` hides the per-transition debug output.

use std::collections::BTreeMap;

use clap::Parser;
use nameplane::sim::{invariants, SimCluster, SimError};
use nameplane::{NodeId, NodeSet, ValuesMap};
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "nameplane-sim")]
#[command(about = "Randomized reconfiguration simulation", long_about = None)]
struct Args {
    /// Seed of the scheduler and of the workload
    #[arg(short, long, default_value = "1")]
    seed: u64,

    /// Number of name servers
    #[arg(short, long, default_value = "7")]
    nodes: u32,

    /// Number of registered names
    #[arg(long, default_value = "4")]
    names: usize,

    /// Reconfiguration rounds
    #[arg(short, long, default_value = "30")]
    rounds: usize,

    /// Probability of losing a packet
    #[arg(long, default_value = "0.05")]
    drop: f64,

    /// Probability of crashing a node in a round
    #[arg(long, default_value = "0.1")]
    crash: f64,
}

const MAX_STEPS: usize = 100_000;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nameplane=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!(
        seed = args.seed,
        nodes = args.nodes,
        names = args.names,
        rounds = args.rounds,
        "starting simulation"
    );

    match run(&args).await {
        Ok(summary) => {
            tracing::info!(
                changes = summary.changes,
                crashes = summary.crashes,
                delivered = summary.delivered,
                dropped = summary.dropped,
                "simulation passed"
            );
            for (name, version) in summary.versions {
                tracing::info!(name = %name, version = %version, "final generation");
            }
            Ok(())
        }
        Err(err) => {
            tracing::error!(seed = args.seed, error = %err, "simulation failed");
            Err(err.into())
        }
    }
}

struct Summary {
    changes: usize,
    crashes: usize,
    delivered: u64,
    dropped: u64,
    versions: BTreeMap<String, nameplane::Version>,
}

async fn run(args: &Args) -> Result<Summary, SimError> {
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed.wrapping_add(1));
    let mut cluster = SimCluster::builder()
        .nodes(args.nodes)
        .seed(args.seed)
        .reorder(true)
        .drop_probability(args.drop)
        .build()?;
    let mut checkers = invariants::all();

    let names: Vec<String> = (0..args.names).map(|i| format!("name{}", i)).collect();
    for name in &names {
        let mut values = ValuesMap::new();
        values.insert("A".to_string(), vec![format!("{}.example", name)]);
        cluster.register(name, values, 60).await?;
    }
    cluster.run_checked(MAX_STEPS, &mut checkers).await?;

    let mut summary = Summary {
        changes: 0,
        crashes: 0,
        delivered: 0,
        dropped: 0,
        versions: BTreeMap::new(),
    };
    let mut crashed: Option<NodeId> = None;
    let all_nodes = cluster.node_ids();
    let period = cluster.config().retry_timeout;

    for round in 0..args.rounds {
        if let Some(id) = crashed.take() {
            cluster.restart(id).await?;
        } else if rng.random_bool(args.crash.clamp(0.0, 1.0)) {
            if let Some(id) = all_nodes.iter().copied().choose(&mut rng) {
                cluster.crash(id);
                crashed = Some(id);
                summary.crashes += 1;
            }
        }

        let Some(name) = names.iter().choose(&mut rng) else {
            break;
        };
        let size = rng.random_range(3..=all_nodes.len().max(3));
        let new_actives: NodeSet = all_nodes
            .iter()
            .copied()
            .choose_multiple(&mut rng, size)
            .into_iter()
            .collect();
        match cluster.propose(name, new_actives.clone()).await {
            Ok(transition) if transition.is_applied() => {
                tracing::debug!(round, name = %name, new_actives = ?new_actives, "proposed");
                summary.changes += 1;
            }
            Ok(_) | Err(SimError::NoController(_)) | Err(SimError::Reconfig(_)) => {}
            Err(err) => return Err(err),
        }

        cluster.run_checked(MAX_STEPS, &mut checkers).await?;
        cluster.advance(period).await?;
    }

    if let Some(id) = crashed.take() {
        cluster.restart(id).await?;
    }
    tracing::info!("faults off, settling");
    let rounds = cluster.config().max_retries as usize;
    for _ in 0..rounds {
        cluster.run_checked(MAX_STEPS, &mut checkers).await?;
        cluster.advance(period).await?;
    }
    cluster.run_checked(MAX_STEPS, &mut checkers).await?;

    for name in &names {
        let record = cluster.assert_converged(name)?;
        summary.versions.insert(name.clone(), record.active_version);
    }
    let stats = cluster.stats();
    summary.delivered = stats.delivered;
    summary.dropped = stats.dropped;
    Ok(summary)
}
