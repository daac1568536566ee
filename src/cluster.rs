//! Cluster orchestration: composes the node supervisor, one node client per
//! node and the wallet manager into a single lifecycle.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::account::{generate_accounts, Account};
use crate::assertions::warn_on_log_asserts;
use crate::bootstrap::{self, BootstrapAccounts};
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::node::{NodeClient, NodeClientSettings};
use crate::poll::wait_for_bool;
use crate::process::Signal;
use crate::supervisor::{NodeHandle, NodeSupervisor};
use crate::topology::ClusterTopology;
use crate::wallet::WalletManager;

/// Wallet holding the `eosio` and producer keys used during bootstrap.
pub const IGNITION_WALLET: &str = "ignition";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    NotLaunched,
    Launching,
    Running,
    PartiallyDown,
    Bouncing,
    Terminated,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct Cluster {
    config: HarnessConfig,
    state: ClusterState,
    wallets: WalletManager,
    supervisor: Option<NodeSupervisor>,
    clients: Vec<NodeClient>,
    accounts: Option<BootstrapAccounts>,
    down_nodes: BTreeSet<usize>,
}

impl Cluster {
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;
        let wallets = WalletManager::new(&config)?;
        Ok(Self {
            config,
            state: ClusterState::NotLaunched,
            wallets,
            supervisor: None,
            clients: Vec::new(),
            accounts: None,
            down_nodes: BTreeSet::new(),
        })
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn wallets(&mut self) -> &mut WalletManager {
        &mut self.wallets
    }

    /// Generates `count` accounts with fresh key pairs and random valid names.
    pub fn create_account_keys(count: usize) -> HarnessResult<Vec<Account>> {
        generate_accounts(count).map_err(|err| HarnessError::KeyGen(err.to_string()))
    }

    /// Starts the wallet daemon and every node of `topology`, then bootstraps
    /// the chain through node 0. Any failure stops what was started.
    ///
    /// A terminated cluster is wiped first, so a relaunch starts a new chain.
    pub async fn launch(&mut self, topology: ClusterTopology) -> HarnessResult<()> {
        match self.state {
            ClusterState::NotLaunched => {}
            ClusterState::Terminated => {
                self.cleanup()?;
                self.supervisor = None;
                self.clients.clear();
                self.accounts = None;
            }
            state => return Err(HarnessError::Launch(format!("cluster is already {state}"))),
        }
        self.state = ClusterState::Launching;
        match self.launch_inner(topology).await {
            Ok(()) => {
                self.state = ClusterState::Running;
                info!(target = "harness::cluster", nodes = self.clients.len(), "cluster running");
                Ok(())
            }
            Err(err) => {
                warn!(target = "harness::cluster", error = %err, "cluster launch failed");
                if let Err(cleanup) = self.killall(false).await {
                    warn!(target = "harness::cluster", error = %cleanup, "cleanup after failed launch");
                }
                Err(match err {
                    HarnessError::Launch(_) => err,
                    other => HarnessError::Launch(other.to_string()),
                })
            }
        }
    }

    async fn launch_inner(&mut self, topology: ClusterTopology) -> HarnessResult<()> {
        let planned = bootstrap::planned_accounts(&self.config, &topology)?;
        self.wallets.launch().await?;
        self.wallets.create(IGNITION_WALLET, &[planned.eosio.clone()]).await?;

        let mut supervisor = NodeSupervisor::new(&self.config, topology.clone())?;
        let launched = supervisor.launch().await;
        self.supervisor = Some(supervisor);
        let handles = launched?;

        let symbol = self.config.chain.core_symbol()?;
        let settings = NodeClientSettings::from_config(&self.config);
        self.clients = handles
            .iter()
            .map(|handle| {
                NodeClient::new(handle.id, &handle.rpc_endpoint, symbol.clone(), settings)
                    .map(|client| client.with_signer(self.wallets.client().clone()))
            })
            .collect::<HarnessResult<_>>()?;
        self.down_nodes.clear();

        let accounts = bootstrap::bootstrap(&self.clients[0], &self.config, &topology).await?;
        self.accounts = Some(accounts);
        Ok(())
    }

    pub fn node(&self, node_id: usize) -> HarnessResult<&NodeClient> {
        self.clients.get(node_id).ok_or_else(|| HarnessError::NotFound {
            entity: "node",
            id: node_id.to_string(),
        })
    }

    pub fn node_handle(&self, node_id: usize) -> HarnessResult<NodeHandle> {
        self.supervisor()?.handle(node_id).cloned()
    }

    pub fn eosio_account(&self) -> HarnessResult<&Account> {
        Ok(&self.bootstrap_accounts()?.eosio)
    }

    pub fn defproducera_account(&self) -> HarnessResult<&Account> {
        self.bootstrap_accounts()?
            .producers
            .first()
            .ok_or_else(|| HarnessError::NotFound {
                entity: "account",
                id: "defproducera".to_string(),
            })
    }

    pub fn bootstrap_accounts(&self) -> HarnessResult<&BootstrapAccounts> {
        self.accounts.as_ref().ok_or_else(|| {
            HarnessError::Launch("cluster has not been bootstrapped".to_string())
        })
    }

    /// Checks every bootstrap account, plus `accounts` when given, against the
    /// chain as seen by the first running node.
    pub async fn validate_accounts(&mut self, accounts: Option<&[Account]>) -> HarnessResult<()> {
        let mut expected = self.bootstrap_accounts()?.all();
        if let Some(extra) = accounts {
            expected.extend(extra.iter().cloned());
        }
        let node_id = self
            .supervisor_mut()?
            .running_nodes()
            .first()
            .copied()
            .ok_or_else(|| HarnessError::Launch("no running node to validate against".to_string()))?;
        let client = self.node(node_id)?;
        for account in &expected {
            if !client.verify_account(account).await? {
                return Err(HarnessError::validation(
                    format!("account {} on node {node_id}", account.name),
                    "present with owner and active keys",
                    "missing or different keys",
                ));
            }
        }
        info!(target = "harness::cluster", node = node_id, accounts = expected.len(), "accounts validated");
        Ok(())
    }

    /// Kills `node_ids` together, relaunches them and re-checks cluster health.
    pub async fn bounce(&mut self, node_ids: &[usize]) -> HarnessResult<()> {
        self.require_launched()?;
        self.state = ClusterState::Bouncing;
        let timeout = self.config.timeouts.relaunch();
        let all_up = self.supervisor_mut()?.bounce(node_ids, timeout).await?;
        for id in node_ids {
            self.down_nodes.remove(id);
        }
        if !all_up {
            self.state = ClusterState::PartiallyDown;
            return Err(HarnessError::process(
                format!("nodes {node_ids:?}"),
                "failed to come back after bounce",
            ));
        }
        self.settle_state();
        info!(target = "harness::cluster", nodes = ?node_ids, "nodes bounced");
        self.health_check().await
    }

    /// Kills `node_ids` without relaunching them and re-checks the remaining nodes.
    pub async fn down(&mut self, node_ids: &[usize]) -> HarnessResult<()> {
        self.require_launched()?;
        self.supervisor_mut()?.down(node_ids).await?;
        self.down_nodes.extend(node_ids.iter().copied());
        self.settle_state();
        info!(target = "harness::cluster", nodes = ?node_ids, "nodes taken down");
        self.health_check().await
    }

    /// Stops a single node with `signal`; the node stays down until relaunched.
    pub async fn kill_node(&mut self, node_id: usize, signal: Signal) -> HarnessResult<()> {
        self.supervisor_mut()?.kill(node_id, signal).await?;
        self.down_nodes.insert(node_id);
        self.settle_state();
        Ok(())
    }

    /// Restarts a killed node on its previous data directory.
    pub async fn relaunch(&mut self, node_id: usize, timeout: Duration) -> bool {
        let Ok(supervisor) = self.supervisor_mut() else {
            return false;
        };
        let relaunched = supervisor.relaunch(node_id, timeout).await;
        if relaunched {
            self.down_nodes.remove(&node_id);
            self.settle_state();
        }
        relaunched
    }

    /// Stops every node and the wallet daemon. Safe to call repeatedly.
    pub async fn killall(&mut self, include_unmanaged: bool) -> HarnessResult<()> {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.killall(include_unmanaged).await?;
        } else if include_unmanaged {
            let binary = self.config.binaries.node.clone();
            if let Some(name) = binary.file_name().and_then(|name| name.to_str()) {
                crate::process::kill_unmanaged(name, &[]);
            }
        }
        self.wallets.killall(include_unmanaged).await?;
        if self.state != ClusterState::NotLaunched || self.supervisor.is_some() {
            self.state = ClusterState::Terminated;
        }
        Ok(())
    }

    /// Removes node directories and wallet files left by earlier runs.
    pub fn cleanup(&mut self) -> HarnessResult<()> {
        self.wallets.cleanup()?;
        let work_dir = &self.config.paths.work_dir;
        if work_dir.exists() {
            fs::remove_dir_all(work_dir)?;
        }
        Ok(())
    }

    /// Number of `Assert` lines in the node's stderr log, reported as a warning.
    pub fn check_logs_for_asserts(&self, node_id: usize) -> HarnessResult<usize> {
        let handle = self.node_handle(node_id)?;
        warn_on_log_asserts(&handle.stderr_path)
    }

    /// Last `lines` lines of every node's stderr log, for failure reports.
    pub fn stderr_tails(&self, lines: usize) -> Vec<(usize, String)> {
        let Ok(supervisor) = self.supervisor() else {
            return Vec::new();
        };
        supervisor
            .handles()
            .into_iter()
            .filter_map(|handle| {
                let content = fs::read_to_string(&handle.stderr_path).ok()?;
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                Some((handle.id, all[start..].join("\n")))
            })
            .collect()
    }

    async fn health_check(&mut self) -> HarnessResult<()> {
        let timeout = self.config.timeouts.relaunch();
        let interval = self.config.timeouts.poll_interval();
        let running = self.supervisor_mut()?.running_nodes();
        let probes = running
            .iter()
            .map(|id| {
                let client = self.node(*id)?;
                Ok(async move {
                    let responsive = wait_for_bool(
                        move || async move { client.is_responsive().await },
                        timeout,
                        interval,
                    )
                    .await;
                    (client.node_id(), responsive)
                })
            })
            .collect::<HarnessResult<Vec<_>>>()?;
        for (id, responsive) in join_all(probes).await {
            if !responsive {
                return Err(HarnessError::Timeout {
                    what: format!("node {id} to answer after a lifecycle change"),
                    timeout,
                });
            }
        }
        if running.is_empty() {
            return Ok(());
        }
        self.validate_accounts(None).await
    }

    fn settle_state(&mut self) {
        self.state = if self.down_nodes.is_empty() {
            ClusterState::Running
        } else {
            ClusterState::PartiallyDown
        };
    }

    fn require_launched(&self) -> HarnessResult<()> {
        match self.state {
            ClusterState::Running | ClusterState::PartiallyDown | ClusterState::Bouncing => Ok(()),
            other => Err(HarnessError::Launch(format!("cluster is {other}"))),
        }
    }

    fn supervisor(&self) -> HarnessResult<&NodeSupervisor> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| HarnessError::Launch("cluster has not been launched".to_string()))
    }

    fn supervisor_mut(&mut self) -> HarnessResult<&mut NodeSupervisor> {
        self.supervisor
            .as_mut()
            .ok_or_else(|| HarnessError::Launch("cluster has not been launched".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.paths.work_dir = dir.join("work");
        config.binaries.node = dir.join("missing-node");
        config.binaries.wallet = dir.join("missing-wallet");
        config.network.http_base_port = None;
        config.network.p2p_base_port = None;
        config.network.wallet_port = None;
        config.timeouts.startup_ms = 500;
        config
    }

    #[tokio::test]
    async fn failed_launch_terminates_and_killall_stays_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cluster = Cluster::new(config(dir.path())).expect("cluster");
        assert_eq!(cluster.state(), ClusterState::NotLaunched);

        let err = cluster
            .launch(ClusterTopology::new(1, 2))
            .await
            .expect_err("wallet binary is missing");
        assert!(matches!(err, HarnessError::Launch(_)), "{err}");
        assert_eq!(cluster.state(), ClusterState::Terminated);

        cluster.killall(false).await.expect("first killall");
        cluster.killall(false).await.expect("second killall");
        assert_eq!(cluster.state(), ClusterState::Terminated);
    }

    #[tokio::test]
    async fn lifecycle_operations_require_a_launched_cluster() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cluster = Cluster::new(config(dir.path())).expect("cluster");
        assert!(cluster.bounce(&[0]).await.is_err());
        assert!(cluster.down(&[0]).await.is_err());
        assert!(!cluster.relaunch(0, Duration::from_millis(10)).await);
        assert!(cluster.eosio_account().is_err());
    }

    #[test]
    fn account_keys_are_unique() {
        let accounts = Cluster::create_account_keys(3).expect("keys");
        assert_eq!(accounts.len(), 3);
        assert_ne!(accounts[0].owner, accounts[1].owner);
        assert_ne!(accounts[0].owner, accounts[0].active);
    }
}
