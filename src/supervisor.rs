//! Launches, signals and relaunches the node processes of a cluster.
//!
//! Each node owns `work_dir/node_XX/` holding its data directory, config
//! directory and the `stdout.txt`/`stderr.txt` logs. A relaunch reuses the
//! same directories, so on-disk chain state survives kill/relaunch cycles.
//!
//! Only node 0 is started with `--enable-stale-production`. Other producer
//! nodes receive their producer names and keys and wait for a producer
//! schedule naming them. `ledger-node-stub` never installs one, so under the
//! stub node 0 is the only producer.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::keys::KeyPair;
use crate::process::{self, ManagedProcess, ProcessSpec, Signal};
use crate::rpc::types::{ChainInfo, EmptyRequest};
use crate::rpc::RpcEndpoint;
use crate::topology::{ClusterTopology, NodeRole};

const NODE_PLUGINS: &[&str] = &[
    "eosio::chain_api_plugin",
    "eosio::producer_api_plugin",
    "eosio::trace_api_plugin",
    "eosio::net_plugin",
];

/// Genesis file shared by every node of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub initial_timestamp: String,
    pub initial_key: String,
}

impl Genesis {
    pub fn new(initial_key: impl Into<String>) -> HarnessResult<Self> {
        let now = OffsetDateTime::now_utc().replace_nanosecond(0).map_err(|err| {
            HarnessError::Config(format!("cannot truncate genesis timestamp: {err}"))
        })?;
        let initial_timestamp = now
            .format(&Rfc3339)
            .map_err(|err| HarnessError::Config(format!("cannot format genesis timestamp: {err}")))?;
        Ok(Self {
            initial_timestamp,
            initial_key: initial_key.into(),
        })
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let content = fs::read(path)?;
        serde_json::from_slice(&content).map_err(|err| {
            HarnessError::Config(format!("invalid genesis file {}: {err}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|err| HarnessError::Config(format!("cannot encode genesis: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }
}

/// Per-node view handed to the orchestrator and to scenarios.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHandle {
    pub id: usize,
    pub role: NodeRole,
    /// `None` while the node is down.
    pub pid: Option<u32>,
    pub rpc_endpoint: String,
    pub http_address: String,
    pub p2p_address: String,
    pub producers: Vec<String>,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

#[derive(Debug)]
struct ManagedNode {
    handle: NodeHandle,
    peers: Vec<String>,
    extra_args: Vec<String>,
    process: Option<ManagedProcess>,
    launched_once: bool,
}

#[derive(Debug)]
pub struct NodeSupervisor {
    binary: PathBuf,
    genesis_path: PathBuf,
    topology: ClusterTopology,
    producer_keys: KeyPair,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    poll_interval: Duration,
    request_timeout: Duration,
    nodes: Vec<ManagedNode>,
}

impl NodeSupervisor {
    /// Lays out directories and endpoints for `topology`. Nothing is spawned yet.
    pub fn new(config: &HarnessConfig, topology: ClusterTopology) -> HarnessResult<Self> {
        topology.validate()?;
        let host = &config.network.host;
        let mut addresses = Vec::with_capacity(topology.total_nodes);
        for id in 0..topology.total_nodes {
            let http_port = port_for(host, config.network.http_base_port, id)?;
            let p2p_port = port_for(host, config.network.p2p_base_port, id)?;
            addresses.push((format!("{host}:{http_port}"), format!("{host}:{p2p_port}")));
        }

        let nodes = (0..topology.total_nodes)
            .map(|id| {
                let node_dir = config.paths.node_dir(id);
                let (http_address, p2p_address) = addresses[id].clone();
                let peers = topology
                    .peers_of(id)
                    .into_iter()
                    .map(|peer| addresses[peer].1.clone())
                    .collect();
                ManagedNode {
                    handle: NodeHandle {
                        id,
                        role: topology.role(id),
                        pid: None,
                        rpc_endpoint: format!("http://{http_address}"),
                        http_address,
                        p2p_address,
                        producers: topology.producers_for(id),
                        data_dir: node_dir.join("data"),
                        config_dir: node_dir.join("config"),
                        stdout_path: node_dir.join("stdout.txt"),
                        stderr_path: node_dir.join("stderr.txt"),
                    },
                    peers,
                    extra_args: topology.args_for(id),
                    process: None,
                    launched_once: false,
                }
            })
            .collect();

        Ok(Self {
            binary: config.binaries.node.clone(),
            genesis_path: config.paths.genesis_path(),
            topology,
            producer_keys: config.chain.eosio_keys()?,
            startup_timeout: config.timeouts.startup(),
            shutdown_timeout: config.timeouts.shutdown(),
            poll_interval: config.timeouts.poll_interval(),
            request_timeout: config.timeouts.request(),
            nodes,
        })
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn genesis_path(&self) -> &Path {
        &self.genesis_path
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.nodes.iter().map(|node| node.handle.clone()).collect()
    }

    pub fn handle(&self, node_id: usize) -> HarnessResult<&NodeHandle> {
        self.node(node_id).map(|node| &node.handle)
    }

    pub fn is_running(&mut self, node_id: usize) -> bool {
        self.nodes
            .get_mut(node_id)
            .and_then(|node| node.process.as_mut())
            .is_some_and(ManagedProcess::is_running)
    }

    /// Ids of nodes with a live process.
    pub fn running_nodes(&mut self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|id| self.is_running(*id)).collect()
    }

    /// Spawns every node and waits for each to answer RPC requests. Any node
    /// failing to come up aborts the launch and stops the ones already started.
    pub async fn launch(&mut self) -> HarnessResult<Vec<NodeHandle>> {
        Genesis::new(self.producer_keys.public_key.clone())?.save(&self.genesis_path)?;
        info!(
            target = "harness::supervisor",
            nodes = self.nodes.len(),
            producers = self.topology.producer_nodes,
            "launching cluster nodes"
        );

        let mut failure = None;
        for id in 0..self.nodes.len() {
            if let Err(err) = self.spawn(id) {
                failure = Some(err);
                break;
            }
        }
        if failure.is_none() {
            for id in 0..self.nodes.len() {
                if let Err(err) = self.await_ready(id, self.startup_timeout).await {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            warn!(target = "harness::supervisor", error = %err, "node launch failed, stopping cluster");
            self.killall(false).await?;
            return Err(HarnessError::Launch(err.to_string()));
        }
        Ok(self.handles())
    }

    /// Sends `signal` and waits for the node to exit. Killing a node that is
    /// already down is a no-op.
    pub async fn kill(&mut self, node_id: usize, signal: Signal) -> HarnessResult<()> {
        let grace = self.shutdown_timeout;
        let node = self.node_mut(node_id)?;
        if let Some(mut child) = node.process.take() {
            let status = child.stop(signal, grace).await?;
            debug!(target = "harness::supervisor", node = node_id, ?signal, %status, "node stopped");
        }
        node.handle.pid = None;
        Ok(())
    }

    /// Restarts a killed node on its previous directories. Returns `false`
    /// when the node does not become ready within `timeout`.
    pub async fn relaunch(&mut self, node_id: usize, timeout: Duration) -> bool {
        if self.is_running(node_id) {
            warn!(target = "harness::supervisor", node = node_id, "relaunch requested for a running node");
            return true;
        }
        let outcome = match self.spawn(node_id) {
            Ok(()) => self.await_ready(node_id, timeout).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                info!(target = "harness::supervisor", node = node_id, "node relaunched");
                true
            }
            Err(err) => {
                warn!(target = "harness::supervisor", node = node_id, error = %err, "node relaunch failed");
                false
            }
        }
    }

    /// Kills `node_ids` without relaunching them.
    pub async fn down(&mut self, node_ids: &[usize]) -> HarnessResult<()> {
        for id in node_ids {
            self.kill(*id, Signal::Kill).await?;
        }
        Ok(())
    }

    /// Kills every target before relaunching any of them, so the outage is
    /// simultaneous. Returns `false` if any node failed to come back.
    pub async fn bounce(&mut self, node_ids: &[usize], timeout: Duration) -> HarnessResult<bool> {
        for id in node_ids {
            self.kill(*id, Signal::Terminate).await?;
        }
        let mut all_up = true;
        for id in node_ids {
            all_up &= self.relaunch(*id, timeout).await;
        }
        Ok(all_up)
    }

    /// Stops every tracked node and, with `include_unmanaged`, any other
    /// process running the node binary.
    pub async fn killall(&mut self, include_unmanaged: bool) -> HarnessResult<()> {
        for id in 0..self.nodes.len() {
            self.kill(id, Signal::Terminate).await?;
        }
        if include_unmanaged {
            if let Some(name) = self.binary.file_name().and_then(|name| name.to_str()) {
                let killed = process::kill_unmanaged(name, &[]);
                debug!(target = "harness::supervisor", killed, "unmanaged nodes killed");
            }
        }
        Ok(())
    }

    fn spawn(&mut self, node_id: usize) -> HarnessResult<()> {
        let spec = self.process_spec(node_id)?;
        let node = self.node_mut(node_id)?;
        fs::create_dir_all(&node.handle.data_dir)?;
        fs::create_dir_all(&node.handle.config_dir)?;
        let child = ManagedProcess::spawn(&spec)?;
        node.handle.pid = Some(child.pid());
        node.process = Some(child);
        node.launched_once = true;
        Ok(())
    }

    async fn await_ready(&mut self, node_id: usize, timeout: Duration) -> HarnessResult<()> {
        let interval = self.poll_interval;
        let endpoint = RpcEndpoint::new(&self.node(node_id)?.handle.rpc_endpoint, self.request_timeout)?;
        let node = self.node_mut(node_id)?;
        let child = node
            .process
            .as_mut()
            .ok_or_else(|| HarnessError::process(format!("node_{node_id:02}"), "not running"))?;
        process::wait_for_ready(
            child,
            || {
                let endpoint = endpoint.clone();
                async move {
                    endpoint
                        .post::<_, ChainInfo>("/v1/chain/get_info", &EmptyRequest {})
                        .await
                        .is_ok()
                }
            },
            timeout,
            interval,
        )
        .await
    }

    fn process_spec(&self, node_id: usize) -> HarnessResult<ProcessSpec> {
        let node = self.node(node_id)?;
        let handle = &node.handle;
        let mut args = vec![
            "--data-dir".to_string(),
            handle.data_dir.display().to_string(),
            "--config-dir".to_string(),
            handle.config_dir.display().to_string(),
            "--http-server-address".to_string(),
            handle.http_address.clone(),
            "--p2p-listen-endpoint".to_string(),
            handle.p2p_address.clone(),
        ];
        if !node.launched_once {
            args.push("--genesis-json".to_string());
            args.push(self.genesis_path.display().to_string());
        }
        for peer in &node.peers {
            args.push("--p2p-peer-address".to_string());
            args.push(peer.clone());
        }
        for plugin in NODE_PLUGINS {
            args.push("--plugin".to_string());
            args.push((*plugin).to_string());
        }
        if !handle.producers.is_empty() {
            for producer in &handle.producers {
                args.push("--producer-name".to_string());
                args.push(producer.clone());
            }
            if let Some(private_key) = &self.producer_keys.private_key {
                args.push("--signature-provider".to_string());
                args.push(format!("{}=KEY:{private_key}", self.producer_keys.public_key));
            }
        }
        if node_id == 0 {
            args.push("--enable-stale-production".to_string());
        }
        args.extend(node.extra_args.iter().cloned());

        Ok(ProcessSpec {
            label: format!("node_{node_id:02}"),
            program: self.binary.clone(),
            args,
            stdout_path: handle.stdout_path.clone(),
            stderr_path: handle.stderr_path.clone(),
        })
    }

    fn node(&self, node_id: usize) -> HarnessResult<&ManagedNode> {
        self.nodes.get(node_id).ok_or_else(|| HarnessError::NotFound {
            entity: "node",
            id: node_id.to_string(),
        })
    }

    fn node_mut(&mut self, node_id: usize) -> HarnessResult<&mut ManagedNode> {
        self.nodes.get_mut(node_id).ok_or_else(|| HarnessError::NotFound {
            entity: "node",
            id: node_id.to_string(),
        })
    }
}

fn port_for(host: &str, base: Option<u16>, node_id: usize) -> HarnessResult<u16> {
    match base {
        Some(base) => u16::try_from(node_id)
            .ok()
            .and_then(|offset| base.checked_add(offset))
            .ok_or_else(|| HarnessError::Config(format!("port overflow for node {node_id}"))),
        None => process::random_port(host),
    }
}
