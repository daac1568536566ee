#![allow(dead_code)]

use std::path::{Path, PathBuf};

use ledger_harness::config::HarnessConfig;

/// Block interval handed to every stub node; keeps irreversibility waits short.
pub const FAST_BLOCKS: [&str; 2] = ["--block-interval-ms", "100"];

pub fn node_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ledger-node-stub"))
}

pub fn wallet_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_wallet-stub"))
}

/// Harness configuration that runs the stub daemons inside `dir` on free ports.
pub fn stub_config(dir: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.binaries.node = node_binary();
    config.binaries.wallet = wallet_binary();
    config.paths.work_dir = dir.join("work");
    config.network.http_base_port = None;
    config.network.p2p_base_port = None;
    config.network.wallet_port = None;
    config.topology.common_args = FAST_BLOCKS.iter().map(|arg| arg.to_string()).collect();

    config.timeouts.startup_ms = 20_000;
    config.timeouts.shutdown_ms = 5_000;
    config.timeouts.request_ms = 5_000;
    config.timeouts.relaunch_ms = 20_000;
    config.timeouts.block_inclusion_ms = 10_000;
    config.timeouts.irreversible_ms = 10_000;
    config.timeouts.poll_interval_ms = 50;
    config.timeouts.delayed_retry_ms = 10_000;
    config
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
