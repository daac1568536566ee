//! Background work of a stub node: block production, pulling blocks from
//! peers and relaying transactions towards the producing node.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ledger_harness::rpc::types::{BlocksRequest, ErrorEnvelope, PushTransactionResponse};
use ledger_harness::transaction::SignedTransaction;

use crate::chain::{Block, Chain, ChainError, SYSTEM_ACCOUNT};

/// Relay hops a transaction may take before it must reach a producer.
pub const MAX_RELAY_HOPS: u8 = 4;
const MAX_BLOCKS_PER_PULL: usize = 500;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// Failure reported by the peer a transaction was relayed to.
    #[error("{}", .envelope.describe())]
    Remote { status: u16, envelope: ErrorEnvelope },
}

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayRequest {
    pub transaction: SignedTransaction,
    pub hops: u8,
}

#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub producing: bool,
    pub peers: Vec<String>,
    pub block_interval: Duration,
    pub request_timeout: Duration,
}

pub struct NodeRuntime {
    chain: Mutex<Chain>,
    settings: RuntimeSettings,
    paused: AtomicBool,
    scheduled_features: Mutex<BTreeSet<String>>,
    http: reqwest::Client,
}

impl NodeRuntime {
    pub fn new(mut chain: Chain, settings: RuntimeSettings) -> Result<Self, reqwest::Error> {
        if settings.producing {
            chain.start_producing();
        }
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            chain: Mutex::new(chain),
            settings,
            paused: AtomicBool::new(false),
            scheduled_features: Mutex::new(BTreeSet::new()),
            http,
        })
    }

    /// Runs `f` with exclusive access to the chain.
    pub fn with_chain<T>(&self, f: impl FnOnce(&mut Chain) -> T) -> T {
        f(&mut self.chain.lock())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("block production paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("block production resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn schedule_features(&self, features: Vec<String>) {
        info!(count = features.len(), "protocol features scheduled for activation");
        self.scheduled_features.lock().extend(features);
    }

    /// Accepts `transaction` on a producing node, or hands it on towards one.
    pub async fn push_transaction(
        &self,
        transaction: SignedTransaction,
        hops: u8,
    ) -> NodeResult<PushTransactionResponse> {
        if self.settings.producing {
            self.check_features(&transaction)?;
            return Ok(self.chain.lock().push_transaction(transaction)?);
        }
        if hops == 0 {
            return Err(ChainError::Unavailable("relay hop limit reached before a producer".to_string()).into());
        }
        self.relay(transaction, hops - 1).await
    }

    fn check_features(&self, transaction: &SignedTransaction) -> Result<(), ChainError> {
        let scheduled = self.scheduled_features.lock();
        for action in &transaction.transaction.actions {
            if action.account != SYSTEM_ACCOUNT || action.name != "activate" {
                continue;
            }
            let digest = action
                .data
                .get("feature_digest")
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            if !scheduled.contains(digest) {
                return Err(ChainError::FeatureNotScheduled(digest.to_string()));
            }
        }
        Ok(())
    }

    async fn relay(&self, transaction: SignedTransaction, hops: u8) -> NodeResult<PushTransactionResponse> {
        let mut last_error = ChainError::Unavailable("node has no peers to relay to".to_string());
        let request = RelayRequest { transaction, hops };
        for peer in &self.settings.peers {
            let url = format!("http://{peer}/v1/net/push_transaction");
            let response = match self.http.post(&url).json(&request).send().await {
                Ok(response) => response,
                Err(err) => {
                    debug!(peer = %peer, error = %err, "relay peer unreachable");
                    last_error = ChainError::Unavailable(format!("relay to {peer} failed: {err}"));
                    continue;
                }
            };
            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|err| ChainError::Unavailable(format!("bad relay response from {peer}: {err}")).into());
            }
            let envelope = response.json::<ErrorEnvelope>().await.unwrap_or_default();
            return Err(NodeError::Remote {
                status: status.as_u16(),
                envelope,
            });
        }
        Err(last_error.into())
    }

    /// Produces one block per interval until `shutdown` fires.
    pub async fn run_producer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.block_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if self.is_paused() {
                continue;
            }
            let produced = self.chain.lock().produce_block(OffsetDateTime::now_utc());
            match produced {
                Ok(block) => debug!(
                    num = block.block_num,
                    id = %block.id,
                    transactions = block.transactions.len(),
                    "produced block"
                ),
                Err(err) => error!(error = %err, "block production failed"),
            }
        }
    }

    /// Pulls new blocks from every peer once per interval until `shutdown` fires.
    pub async fn run_sync(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.settings.peers.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(self.settings.block_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            for peer in &self.settings.peers {
                self.pull_from(peer).await;
            }
        }
    }

    async fn pull_from(&self, peer: &str) {
        let since = self.chain.lock().head().block_num;
        let url = format!("http://{peer}/v1/net/blocks");
        let blocks: Vec<Block> = match self.http.post(&url).json(&BlocksRequest { since }).send().await {
            Ok(response) if response.status().is_success() => match response.json().await {
                Ok(blocks) => blocks,
                Err(err) => {
                    warn!(peer, error = %err, "undecodable blocks from peer");
                    return;
                }
            },
            // peers come and go while the cluster is bounced
            _ => return,
        };
        if blocks.is_empty() {
            return;
        }
        let mut chain = self.chain.lock();
        for block in blocks {
            let num = block.block_num;
            if let Err(err) = chain.accept_block(block) {
                warn!(peer, num, error = %err, "rejected block from peer");
                break;
            }
        }
        debug!(peer, head = chain.head().block_num, "synced from peer");
    }

    pub fn blocks_since(&self, since: u32) -> Vec<Block> {
        self.chain.lock().blocks_since(since, MAX_BLOCKS_PER_PULL)
    }
}
