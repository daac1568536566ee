//! Process-level orchestration and validation harness for multi-node ledger
//! clusters.
//!
//! The harness launches node and wallet daemons as child processes, talks to
//! them only over their JSON RPC surfaces, and drives scripted scenarios that
//! create accounts, move tokens, bounce nodes and compare snapshots.
//!
//! [`cluster::Cluster`] is the main entry point: it composes the
//! [`supervisor::NodeSupervisor`], one [`node::NodeClient`] per node and the
//! [`wallet::WalletManager`]. Scenarios implement [`scenario::Scenario`] and are
//! run through [`scenario::execute`], which applies the teardown policy from
//! [`config::HarnessConfig`].

pub mod account;
pub mod assertions;
pub mod asset;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod keys;
pub mod node;
pub mod poll;
pub mod process;
pub mod rpc;
pub mod scenario;
pub mod scenarios;
pub mod supervisor;
pub mod topology;
pub mod transaction;
pub mod wallet;

pub use account::Account;
pub use asset::{Asset, Symbol};
pub use cluster::{Cluster, ClusterState};
pub use config::HarnessConfig;
pub use errors::{HarnessError, HarnessResult};
pub use node::NodeClient;
pub use scenario::{Scenario, TestContext, Verdict};
pub use topology::ClusterTopology;
