//! Single-process stand-in for a ledger node daemon.
//!
//! Serves the chain, trace, producer and net RPC surfaces the harness drives,
//! produces blocks when started as the stale-production node and otherwise
//! follows its peers.

mod api;
mod chain;
mod runtime;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ledger_harness::keys::public_key_of;

use crate::chain::{Chain, ReadMode};
use crate::runtime::{NodeRuntime, RuntimeSettings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stand-in ledger node daemon")]
struct Args {
    #[arg(long = "data-dir")]
    data_dir: PathBuf,
    #[arg(long = "config-dir")]
    config_dir: Option<PathBuf>,
    /// Genesis file; only needed on the first start of a data directory
    #[arg(long = "genesis-json")]
    genesis_json: Option<PathBuf>,
    #[arg(long = "http-server-address", default_value = "127.0.0.1:8888")]
    http_address: SocketAddr,
    #[arg(long = "p2p-listen-endpoint", default_value = "127.0.0.1:9876")]
    p2p_address: SocketAddr,
    #[arg(long = "p2p-peer-address")]
    peers: Vec<String>,
    #[arg(long = "plugin")]
    plugins: Vec<String>,
    #[arg(long = "producer-name")]
    producer_names: Vec<String>,
    /// `PUBLIC=KEY:PRIVATE`
    #[arg(long = "signature-provider")]
    signature_provider: Option<String>,
    #[arg(long = "enable-stale-production", default_value_t = false)]
    enable_stale_production: bool,
    #[arg(long = "read-mode", default_value = "head")]
    read_mode: String,
    #[arg(long = "block-interval-ms", default_value_t = 500)]
    block_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let read_mode = ReadMode::parse(&args.read_mode)
        .with_context(|| format!("unsupported read mode {:?}", args.read_mode))?;
    if let Some(provider) = &args.signature_provider {
        check_signature_provider(provider)?;
    }
    if let Some(config_dir) = &args.config_dir {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("creating {}", config_dir.display()))?;
    }

    let producing = args.enable_stale_production && !args.producer_names.is_empty();
    let chain = Chain::open(&args.data_dir, args.genesis_json.as_deref(), read_mode)
        .with_context(|| format!("opening chain in {}", args.data_dir.display()))?;
    info!(
        chain_id = chain.chain_id(),
        head = chain.head().block_num,
        ?read_mode,
        producing,
        plugins = ?args.plugins,
        "chain opened"
    );

    let block_interval = Duration::from_millis(args.block_interval_ms.max(10));
    let runtime = Arc::new(NodeRuntime::new(
        chain,
        RuntimeSettings {
            producing,
            peers: args.peers.clone(),
            block_interval,
            request_timeout: Duration::from_secs(2),
        },
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    if producing {
        workers.push(tokio::spawn(runtime.clone().run_producer(shutdown_rx.clone())));
    } else {
        workers.push(tokio::spawn(runtime.clone().run_sync(shutdown_rx.clone())));
    }

    let http_listener = tokio::net::TcpListener::bind(args.http_address)
        .await
        .with_context(|| format!("binding {}", args.http_address))?;
    let p2p_listener = tokio::net::TcpListener::bind(args.p2p_address)
        .await
        .with_context(|| format!("binding {}", args.p2p_address))?;
    info!(http = %args.http_address, p2p = %args.p2p_address, peers = ?args.peers, "node listening");

    let http_server = axum::serve(http_listener, api::router(runtime.clone()))
        .with_graceful_shutdown(wait_for(shutdown_rx.clone()));
    let p2p_server = axum::serve(p2p_listener, api::router(runtime.clone()))
        .with_graceful_shutdown(wait_for(shutdown_rx.clone()));
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });
    tokio::try_join!(http_server.into_future(), p2p_server.into_future()).context("rpc server failed")?;
    for worker in workers {
        if let Err(err) = worker.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    info!(head = runtime.with_chain(|chain| chain.head().block_num), "node stopped");
    Ok(())
}

fn check_signature_provider(provider: &str) -> Result<()> {
    let Some((public_key, private_key)) = provider.split_once("=KEY:") else {
        bail!("signature provider must look like PUBLIC=KEY:PRIVATE");
    };
    if public_key_of(private_key)? != public_key {
        bail!("signature provider private key does not match {public_key}");
    }
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_harness::config::DEFAULT_EOSIO_PRIVATE_KEY;

    #[test]
    fn signature_provider_must_pair_keys() {
        let public_key = public_key_of(DEFAULT_EOSIO_PRIVATE_KEY).expect("public key");
        check_signature_provider(&format!("{public_key}=KEY:{DEFAULT_EOSIO_PRIVATE_KEY}")).expect("valid provider");

        let other = ledger_harness::keys::generate_key_pair();
        assert!(check_signature_provider(&format!("{}=KEY:{DEFAULT_EOSIO_PRIVATE_KEY}", other.public_key)).is_err());
        assert!(check_signature_provider("garbage").is_err());
    }

    #[test]
    fn repeated_flags_collect_in_order() {
        let args = Args::try_parse_from([
            "ledger-node-stub",
            "--data-dir",
            "/tmp/node",
            "--p2p-peer-address",
            "127.0.0.1:9001",
            "--p2p-peer-address",
            "127.0.0.1:9002",
            "--producer-name",
            "eosio",
            "--enable-stale-production",
            "--read-mode",
            "irreversible",
        ])
        .expect("parse");
        assert_eq!(args.peers, vec!["127.0.0.1:9001", "127.0.0.1:9002"]);
        assert_eq!(args.producer_names, vec!["eosio"]);
        assert!(args.enable_stale_production);
        assert_eq!(ReadMode::parse(&args.read_mode), Some(ReadMode::Irreversible));
    }
}
