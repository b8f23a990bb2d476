//! Simulation tests for the reconfiguration protocol.
//!
//! Every scenario runs a whole directory in one process through
//! `SimCluster`: controllers and active replicas exchange framed packets
//! over the in-process bus and decide through the local consensus, while
//! the scheduler reorders and drops packets, crashes nodes and makes store
//! writes ambiguous.
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ Controller 1 │  │ Controller 2 │  │ Controller 3 │   ← controller group of a name
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        │   stop / start / delete-old        │
//!        ▼                 ▼                  ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Active 4    │  │  Active 5    │  │  Active 6    │   ← generation v+1
//! └──────────────┘  └──────────────┘  └──────────────┘
//! ```
//!
//! Safety checkers run after every delivered packet or decision; liveness
//! is checked once faults stop, by requiring every name to converge.

#![allow(dead_code)]

pub mod invariants;
#[cfg(test)]
pub mod test_scenarios;
pub mod workloads;
