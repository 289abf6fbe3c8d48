//! A Byzantine-fault-tolerant state-machine replication core: primary
//! election plus three-phase (PRE-PREPARE/PREPARE/COMMIT) ordering over
//! `N = 3f+1` nodes, each running `f+1` protocol instances so a monitor
//! can compare the master instance's throughput against its backups.
//!
//! The core is transport-, clock- and storage-agnostic: a host wires up
//! `Transport`/`Clock`/`Crypto`/`Ledger`/`PoolConfig`/`NodeObserver`
//! (`collab.rs`) and drives a `Node` via `tick`/`drain`. `sim` provides an
//! in-memory implementation of all five for tests and the demo binary.

pub mod collab;
pub mod config;
pub mod elector;
pub mod error;
pub mod ids;
pub mod messages;
pub mod monitor;
pub mod node;
pub mod replica;
pub mod router;
pub mod sim;
pub mod suspicion;

pub use error::{CoreError, CoreResult};
pub use node::Node;
