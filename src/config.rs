use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::asset::{Asset, Symbol};
use crate::errors::{HarnessError, HarnessResult};
use crate::keys::KeyPair;
use crate::topology::{ClusterTopology, PeerShape};

/// Development key of the `eosio` system account baked into default genesis files.
pub const DEFAULT_EOSIO_PRIVATE_KEY: &str =
    "PVT_ED25519_5f1d3a1a0c2b4e6d8f70921a3b5c7d9e1f20314253647586978a9bacbdcedf01";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|err| {
            HarnessError::Config(format!("unable to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| HarnessError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        self.topology.to_topology()?.validate()?;
        self.chain.core_symbol()?;
        self.chain.eosio_keys()?;
        if self.timeouts.poll_interval_ms == 0 {
            return Err(HarnessError::Config(
                "timeouts.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.timeouts.request_ms == 0 {
            return Err(HarnessError::Config(
                "timeouts.request_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BinariesConfig {
    pub node: PathBuf,
    pub wallet: PathBuf,
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            node: PathBuf::from("nodeos"),
            wallet: PathBuf::from("keosd"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of per-node data directories, logs and the wallet directory.
    pub work_dir: PathBuf,
    /// Directory holding `<contract>/<contract>.wasm` and `.abi` files.
    #[serde(default)]
    pub contracts_dir: Option<PathBuf>,
}

impl PathsConfig {
    pub fn node_dir(&self, node_id: usize) -> PathBuf {
        self.work_dir.join(format!("node_{node_id:02}"))
    }

    pub fn wallet_dir(&self) -> PathBuf {
        self.work_dir.join("wallet")
    }

    pub fn genesis_path(&self) -> PathBuf {
        self.work_dir.join("genesis.json")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./harness-work"),
            contracts_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    /// First node HTTP port; node `i` listens on `http_base_port + i`.
    /// When unset every endpoint gets a free ephemeral port.
    #[serde(default)]
    pub http_base_port: Option<u16>,
    #[serde(default)]
    pub p2p_base_port: Option<u16>,
    #[serde(default)]
    pub wallet_port: Option<u16>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_base_port: Some(8888),
            p2p_base_port: Some(9876),
            wallet_port: Some(9899),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub startup_ms: u64,
    pub shutdown_ms: u64,
    pub request_ms: u64,
    pub relaunch_ms: u64,
    pub block_inclusion_ms: u64,
    pub irreversible_ms: u64,
    pub poll_interval_ms: u64,
    pub delayed_retry_ms: u64,
}

impl TimeoutsConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn relaunch(&self) -> Duration {
        Duration::from_millis(self.relaunch_ms)
    }

    pub fn block_inclusion(&self) -> Duration {
        Duration::from_millis(self.block_inclusion_ms)
    }

    pub fn irreversible(&self) -> Duration {
        Duration::from_millis(self.irreversible_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn delayed_retry(&self) -> Duration {
        Duration::from_millis(self.delayed_retry_ms)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            startup_ms: 60_000,
            shutdown_ms: 30_000,
            request_ms: 5_000,
            relaunch_ms: 30_000,
            block_inclusion_ms: 60_000,
            // one producer, half-second blocks, two rounds plus padding
            irreversible_ms: 72_000,
            poll_interval_ms: 250,
            delayed_retry_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub core_symbol: String,
    pub precision: u8,
    pub eosio_private_key: String,
    /// Maximum supply of the core token, in whole tokens.
    pub max_supply: i64,
    /// Amount issued to `eosio` during bootstrap, in whole tokens.
    pub initial_issue: i64,
    /// Liquid balance every producer account receives, in whole tokens.
    pub producer_funding: i64,
    #[serde(default)]
    pub protocol_features: Vec<String>,
    #[serde(default)]
    pub load_system_contract: bool,
    /// Maximum lifetime of submitted transactions, in seconds.
    pub transaction_expiration_secs: u64,
}

impl ChainConfig {
    pub fn core_symbol(&self) -> HarnessResult<Symbol> {
        Symbol::new(self.core_symbol.clone(), self.precision)
    }

    pub fn eosio_keys(&self) -> HarnessResult<KeyPair> {
        KeyPair::from_private(&self.eosio_private_key)
    }

    pub fn asset(&self, whole_tokens: i64) -> HarnessResult<Asset> {
        Asset::whole(whole_tokens, self.core_symbol()?)
    }

    pub fn transaction_expiration(&self) -> Duration {
        Duration::from_secs(self.transaction_expiration_secs)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            core_symbol: "SYS".to_string(),
            precision: 4,
            eosio_private_key: DEFAULT_EOSIO_PRIVATE_KEY.to_string(),
            max_supply: 10_000_000_000,
            initial_issue: 1_000_000_000,
            producer_funding: 1_000_000,
            protocol_features: Vec::new(),
            load_system_contract: false,
            transaction_expiration_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub producer_nodes: usize,
    pub total_nodes: usize,
    pub producers_per_node: usize,
    pub shape: PeerShape,
    /// Extra command line arguments keyed by node id. TOML table keys are
    /// strings, so ids are parsed when the topology is built.
    #[serde(default)]
    pub extra_args: BTreeMap<String, Vec<String>>,
    /// Extra command line arguments passed to every node.
    #[serde(default)]
    pub common_args: Vec<String>,
}

impl TopologyConfig {
    pub fn to_topology(&self) -> HarnessResult<ClusterTopology> {
        let extra_args = self
            .extra_args
            .iter()
            .map(|(id, args)| {
                let id = id.parse::<usize>().map_err(|_| {
                    HarnessError::Config(format!("topology.extra_args key {id:?} is not a node id"))
                })?;
                Ok((id, args.clone()))
            })
            .collect::<HarnessResult<_>>()?;
        Ok(ClusterTopology {
            producer_nodes: self.producer_nodes,
            total_nodes: self.total_nodes,
            producers_per_node: self.producers_per_node,
            shape: self.shape,
            extra_args,
            common_args: self.common_args.clone(),
        })
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            producer_nodes: 1,
            total_nodes: 2,
            producers_per_node: 1,
            shape: PeerShape::Mesh,
            extra_args: BTreeMap::new(),
            common_args: Vec::new(),
        }
    }
}

/// Teardown behaviour, mirroring the flags every scenario accepts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub keep_logs: bool,
    #[serde(default)]
    pub leave_running: bool,
    /// Kill stray node and wallet processes from earlier runs before launching.
    #[serde(default)]
    pub clean_run: bool,
    #[serde(default)]
    pub dump_error_details: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harness.toml");
        let mut config = HarnessConfig::default();
        config.topology.extra_args.insert("1".into(), vec!["--read-mode".into(), "irreversible".into()]);
        config.save(&path).expect("save");

        let loaded = HarnessConfig::load(&path).expect("load");
        assert_eq!(loaded.chain.core_symbol, "SYS");
        let topology = loaded.topology.to_topology().expect("topology");
        assert_eq!(topology.extra_args.get(&1).map(Vec::len), Some(2));
        assert_eq!(loaded.timeouts.request(), Duration::from_secs(5));
    }

    #[test]
    fn more_producers_than_nodes_is_rejected() {
        let mut config = HarnessConfig::default();
        config.topology.producer_nodes = 3;
        config.topology.total_nodes = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn extra_args_keys_must_be_node_ids() {
        let mut config = HarnessConfig::default();
        config.topology.extra_args.insert("first".into(), vec!["--read-mode".into()]);
        let err = config.validate().expect_err("non-numeric key");
        assert!(err.to_string().contains("first"), "{err}");
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[binaries]\nnode = \"/opt/bin/node\"\nwallet = \"/opt/bin/walletd\"\n").expect("write");
        let config = HarnessConfig::load(&path).expect("load");
        assert_eq!(config.binaries.node, PathBuf::from("/opt/bin/node"));
        assert_eq!(config.topology.total_nodes, 2);
    }

    #[test]
    fn node_directories_are_zero_padded() {
        let paths = PathsConfig::default();
        assert!(paths.node_dir(2).ends_with("node_02"));
    }
}
