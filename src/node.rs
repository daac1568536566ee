//! Typed client for one ledger node.
//!
//! Every state query goes to the node; nothing read from the chain is cached
//! locally. Transactions are built here, signed by the wallet daemon and
//! pushed back to this node.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::asset::{Asset, Symbol};
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult, RpcError, RpcErrorKind};
use crate::poll::{retry_with_backoff, wait_for_bool, wait_for_value};
use crate::rpc::types::{
    AccountResponse, Authority, BlocksRequest, ChainInfo, CurrencyBalanceRequest, EmptyRequest,
    GetAccountRequest, ProtocolFeatureActivationRequest, PushTransactionResponse,
    RequiredKeysRequest, RequiredKeysResponse, ResultResponse, SnapshotResponse,
    TransactionTrace, TransactionTraceRequest,
};
use crate::rpc::RpcEndpoint;
use crate::transaction::{Action, PermissionLevel, SignedTransaction, Transaction, TransactionRecord};
use crate::wallet::WalletClient;

pub const TOKEN_CONTRACT: &str = "eosio.token";
pub const SYSTEM_ACCOUNT: &str = "eosio";
pub const NULL_ACCOUNT: &str = "eosio.null";

/// RAM bought for accounts that do not ask for a specific amount.
pub const DEFAULT_RAM_BYTES: u64 = 8_192;
/// Whole tokens staked for both NET and CPU by `create_initialize_account`.
pub const DEFAULT_STAKE_TOKENS: i64 = 100;

/// Timing knobs of a node client, derived from the harness timeouts.
#[derive(Clone, Copy, Debug)]
pub struct NodeClientSettings {
    pub request_timeout: Duration,
    pub block_inclusion: Duration,
    pub irreversible: Duration,
    pub poll_interval: Duration,
    pub delayed_retry: Duration,
    pub expiration: Duration,
}

impl NodeClientSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            request_timeout: config.timeouts.request(),
            block_inclusion: config.timeouts.block_inclusion(),
            irreversible: config.timeouts.irreversible(),
            poll_interval: config.timeouts.poll_interval(),
            delayed_retry: config.timeouts.delayed_retry(),
            expiration: config.chain.transaction_expiration(),
        }
    }
}

/// Optional knobs of [`NodeClient::push_actions`].
#[derive(Clone, Debug, Default)]
pub struct PushOptions {
    pub delay_sec: u32,
    pub context_free_actions: Vec<Action>,
    pub wait_for_block: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TransferKey {
    from: String,
    to: String,
    units: i64,
    memo: String,
}

#[derive(Clone, Debug)]
pub struct NodeClient {
    node_id: usize,
    endpoint: RpcEndpoint,
    signer: Option<WalletClient>,
    symbol: Symbol,
    settings: NodeClientSettings,
    recent_transfers: Arc<Mutex<HashMap<TransferKey, Instant>>>,
}

impl NodeClient {
    pub fn new(
        node_id: usize,
        base_url: &str,
        symbol: Symbol,
        settings: NodeClientSettings,
    ) -> HarnessResult<Self> {
        Ok(Self {
            node_id,
            endpoint: RpcEndpoint::new(base_url, settings.request_timeout)?,
            signer: None,
            symbol,
            settings,
            recent_transfers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_signer(mut self, signer: WalletClient) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn base_url(&self) -> String {
        self.endpoint.base_url().to_string()
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn settings(&self) -> &NodeClientSettings {
        &self.settings
    }

    pub async fn get_info(&self) -> HarnessResult<ChainInfo> {
        let info: ChainInfo = self.endpoint.post("/v1/chain/get_info", &EmptyRequest {}).await?;
        info.validate()?;
        Ok(info)
    }

    /// `true` when the node answers `get_info`.
    pub async fn is_responsive(&self) -> bool {
        self.get_info().await.is_ok()
    }

    pub async fn get_head_block_num(&self) -> HarnessResult<u32> {
        Ok(self.get_info().await?.head_block_num)
    }

    pub async fn get_irreversible_block_num(&self) -> HarnessResult<u32> {
        Ok(self.get_info().await?.last_irreversible_block_num)
    }

    /// The chain's view of `name`, or `None` when the account does not exist.
    pub async fn get_account(&self, name: &str) -> HarnessResult<Option<AccountResponse>> {
        self.endpoint
            .post_optional(
                "/v1/chain/get_account",
                &GetAccountRequest {
                    account_name: name.to_string(),
                },
            )
            .await
    }

    /// Checks that the chain holds `account` with the expected owner and active keys.
    pub async fn verify_account(&self, account: &Account) -> HarnessResult<bool> {
        let Some(response) = self.get_account(&account.name).await? else {
            debug!(target = "harness::node", node = self.node_id, account = %account.name, "account missing");
            return Ok(false);
        };
        let holds = |perm: &str, key: &str| {
            response
                .permission(perm)
                .is_some_and(|permission| permission.required_auth.contains_key(key))
        };
        let matches = response.account_name == account.name
            && holds("owner", &account.owner.public_key)
            && holds("active", &account.active.public_key);
        if !matches {
            warn!(
                target = "harness::node",
                node = self.node_id,
                account = %account.name,
                "account keys differ from the expected key pairs"
            );
        }
        Ok(matches)
    }

    /// Liquid balance of `account_name` formatted as reported by the node.
    pub async fn get_account_balance(&self, account_name: &str) -> HarnessResult<String> {
        Ok(self.get_account_asset(account_name).await?.to_string())
    }

    pub async fn get_account_asset(&self, account_name: &str) -> HarnessResult<Asset> {
        let balances: Vec<String> = self
            .endpoint
            .post(
                "/v1/chain/get_currency_balance",
                &CurrencyBalanceRequest {
                    code: TOKEN_CONTRACT.to_string(),
                    account: account_name.to_string(),
                    symbol: Some(self.symbol.code().to_string()),
                },
            )
            .await?;
        match balances.first() {
            Some(balance) => Asset::parse(balance).map_err(|err| HarnessError::Schema {
                endpoint: "/v1/chain/get_currency_balance".to_string(),
                message: err.to_string(),
            }),
            // accounts that never held the token report no row at all
            None => Ok(Asset::zero(self.symbol.clone())),
        }
    }

    /// Signs `actions` through the wallet daemon and pushes them to this node.
    pub async fn push_actions(
        &self,
        actions: Vec<Action>,
        options: PushOptions,
    ) -> HarnessResult<TransactionRecord> {
        let wait = options.wait_for_block && options.delay_sec == 0;
        let record = self.submit_actions(actions, options).await?;
        if wait {
            self.require_in_block(&record.id).await?;
        }
        Ok(record)
    }

    /// Signs and pushes without waiting for block inclusion.
    async fn submit_actions(
        &self,
        actions: Vec<Action>,
        options: PushOptions,
    ) -> HarnessResult<TransactionRecord> {
        let info = self.get_info().await?;
        let mut transaction = Transaction::new(&info, self.settings.expiration, actions)?
            .with_delay(options.delay_sec);
        transaction.context_free_actions = options.context_free_actions;

        let signed = self.sign(&transaction, &info.chain_id).await?;
        let response: PushTransactionResponse =
            self.endpoint.post("/v1/chain/push_transaction", &signed).await?;
        let record = TransactionRecord::from(response);
        debug!(
            target = "harness::node",
            node = self.node_id,
            id = %record.id,
            block = record.block_num,
            delay = options.delay_sec,
            "transaction accepted"
        );
        Ok(record)
    }

    async fn sign(&self, transaction: &Transaction, chain_id: &str) -> HarnessResult<SignedTransaction> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            HarnessError::Wallet(format!("node {} has no wallet attached for signing", self.node_id))
        })?;
        let available_keys = signer.get_public_keys().await?;
        let required: RequiredKeysResponse = self
            .endpoint
            .post(
                "/v1/chain/get_required_keys",
                &RequiredKeysRequest {
                    transaction: transaction.clone(),
                    available_keys,
                },
            )
            .await?;
        signer
            .sign_transaction(transaction, &required.required_keys, chain_id)
            .await
    }

    /// Creates `account` paid for by `creator`, buying `ram_bytes` of RAM and
    /// staking `staked` for NET and CPU each when non-zero. Returns the
    /// transaction id.
    pub async fn create_account(
        &self,
        account: &Account,
        creator: &Account,
        ram_bytes: u64,
        staked: Option<&Asset>,
        wait_for_block: bool,
    ) -> HarnessResult<String> {
        let auth = vec![PermissionLevel::active(&creator.name)];
        let mut actions = vec![Action::new(
            SYSTEM_ACCOUNT,
            "newaccount",
            auth.clone(),
            json!({
                "creator": creator.name,
                "name": account.name,
                "owner": Authority::single_key(&account.owner.public_key),
                "active": Authority::single_key(&account.active.public_key),
            }),
        )?];
        if ram_bytes > 0 {
            actions.push(Action::new(
                SYSTEM_ACCOUNT,
                "buyrambytes",
                auth.clone(),
                json!({"payer": creator.name, "receiver": account.name, "bytes": ram_bytes}),
            )?);
        }
        if let Some(stake) = staked.filter(|stake| stake.units() > 0) {
            actions.push(Action::new(
                SYSTEM_ACCOUNT,
                "delegatebw",
                auth,
                json!({
                    "from": creator.name,
                    "receiver": account.name,
                    "stake_net_quantity": stake,
                    "stake_cpu_quantity": stake,
                    "transfer": false,
                }),
            )?);
        }

        let record = self
            .push_actions(
                actions,
                PushOptions {
                    wait_for_block,
                    ..PushOptions::default()
                },
            )
            .await?;
        info!(
            target = "harness::node",
            node = self.node_id,
            account = %account.name,
            creator = %creator.name,
            id = %record.id,
            "account created"
        );
        Ok(record.id)
    }

    /// Creates `account` with default RAM and stake, then transfers
    /// `staked_deposit` minor units from `creator` with memo `init` once the
    /// creation is in a block.
    pub async fn create_initialize_account(
        &self,
        account: &Account,
        creator: &Account,
        staked_deposit: i64,
        wait_for_block: bool,
    ) -> HarnessResult<String> {
        let ram_bytes = if account.ram_bytes > 0 {
            account.ram_bytes
        } else {
            DEFAULT_RAM_BYTES
        };
        let stake = Asset::whole(DEFAULT_STAKE_TOKENS, self.symbol.clone())?;
        let id = self
            .create_account(account, creator, ram_bytes, Some(&stake), staked_deposit > 0 || wait_for_block)
            .await?;

        if staked_deposit > 0 {
            let deposit = Asset::from_units(staked_deposit, self.symbol.clone());
            self.transfer_funds(creator, account, &deposit.to_string(), "init", false, wait_for_block)
                .await?;
        }
        Ok(id)
    }

    /// Transfers `amount` (e.g. `"97.5321 SYS"`) from `from` to `to`.
    ///
    /// An identical transfer submitted within the transaction expiration
    /// window is refused locally unless `force` is set; forced transfers carry
    /// a random nonce so the node sees a distinct transaction.
    pub async fn transfer_funds(
        &self,
        from: &Account,
        to: &Account,
        amount: &str,
        memo: &str,
        force: bool,
        wait_for_block: bool,
    ) -> HarnessResult<TransactionRecord> {
        let quantity = Asset::parse(amount)?;
        if quantity.symbol() != &self.symbol {
            return Err(HarnessError::validation(
                format!("symbol of transfer amount {amount}"),
                &self.symbol,
                quantity.symbol(),
            ));
        }
        let key = TransferKey {
            from: from.name.clone(),
            to: to.name.clone(),
            units: quantity.units(),
            memo: memo.to_string(),
        };
        if !force {
            self.guard_duplicate(&key)?;
        }

        let action = Action::new(
            TOKEN_CONTRACT,
            "transfer",
            vec![PermissionLevel::active(&from.name)],
            json!({"from": from.name, "to": to.name, "quantity": quantity, "memo": memo}),
        )?;
        let mut options = PushOptions::default();
        if force {
            let nonce: u64 = rand::thread_rng().gen();
            options.context_free_actions.push(Action::new(
                NULL_ACCOUNT,
                "nonce",
                Vec::new(),
                json!({"value": format!("{nonce:016x}")}),
            )?);
        }

        let record = match self.submit_actions(vec![action], options).await {
            Ok(record) => record,
            Err(err) => {
                // only a transfer the node never accepted may be resubmitted
                self.recent_transfers.lock().remove(&key);
                return Err(err);
            }
        };
        info!(
            target = "harness::node",
            node = self.node_id,
            from = %from.name,
            to = %to.name,
            %quantity,
            force,
            id = %record.id,
            "transfer submitted"
        );
        if wait_for_block {
            self.require_in_block(&record.id).await?;
        }
        Ok(record)
    }

    fn guard_duplicate(&self, key: &TransferKey) -> HarnessResult<()> {
        let now = Instant::now();
        let window = self.settings.expiration;
        let mut recent = self.recent_transfers.lock();
        recent.retain(|_, submitted| now.duration_since(*submitted) < window);
        if recent.contains_key(key) {
            return Err(RpcError::rejected(
                "/v1/chain/push_transaction",
                None,
                RpcErrorKind::LocalDuplicate,
                format!(
                    "identical transfer {} -> {} of {} units already submitted",
                    key.from, key.to, key.units
                ),
            )
            .into());
        }
        recent.insert(key.clone(), now);
        Ok(())
    }

    async fn fetch_transaction(&self, id: &str) -> HarnessResult<Option<TransactionRecord>> {
        let trace: Option<TransactionTrace> = self
            .endpoint
            .post_optional(
                "/v1/trace_api/get_transaction_trace",
                &TransactionTraceRequest { id: id.to_string() },
            )
            .await?;
        Ok(trace.map(TransactionRecord::from))
    }

    /// Fetches a transaction by id. With `delayed_retry` the lookup is retried
    /// with backoff to ride out the window before the containing block exists.
    pub async fn get_transaction(&self, id: &str, delayed_retry: bool) -> HarnessResult<TransactionRecord> {
        let found = if delayed_retry {
            // only absence is retried; transport and schema failures surface at once
            retry_with_backoff(
                move || async move { self.fetch_transaction(id).await.transpose() },
                self.settings.delayed_retry,
                self.settings.poll_interval,
                self.settings.poll_interval * 8,
            )
            .await
            .transpose()?
        } else {
            self.fetch_transaction(id).await?
        };
        found.ok_or_else(|| HarnessError::NotFound {
            entity: "transaction",
            id: id.to_string(),
        })
    }

    /// Waits until the block containing `id` has been produced.
    pub async fn wait_for_transaction_in_block(&self, id: &str, timeout: Duration) -> bool {
        wait_for_bool(
            move || async move {
                match self.fetch_transaction(id).await {
                    Ok(Some(record)) => self
                        .get_head_block_num()
                        .await
                        .is_ok_and(|head| head >= record.block_num),
                    _ => false,
                }
            },
            timeout,
            self.settings.poll_interval,
        )
        .await
    }

    /// Waits until the block containing `id` is irreversible.
    pub async fn wait_for_transaction_irreversible(&self, id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let block_num = wait_for_value(
            move || async move { self.fetch_transaction(id).await.ok().flatten().map(|record| record.block_num) },
            timeout,
            self.settings.poll_interval,
        )
        .await;
        match block_num {
            Some(block_num) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.wait_for_irreversible_block(block_num, remaining).await
            }
            None => false,
        }
    }

    pub async fn wait_for_irreversible_block(&self, block_num: u32, timeout: Duration) -> bool {
        wait_for_bool(
            move || async move {
                self.get_irreversible_block_num()
                    .await
                    .is_ok_and(|lib| lib >= block_num)
            },
            timeout,
            self.settings.poll_interval,
        )
        .await
    }

    pub async fn wait_for_head_block(&self, block_num: u32, timeout: Duration) -> bool {
        wait_for_bool(
            move || async move { self.get_head_block_num().await.is_ok_and(|head| head >= block_num) },
            timeout,
            self.settings.poll_interval,
        )
        .await
    }

    async fn require_in_block(&self, id: &str) -> HarnessResult<()> {
        if self
            .wait_for_transaction_in_block(id, self.settings.block_inclusion)
            .await
        {
            Ok(())
        } else {
            Err(HarnessError::Timeout {
                what: format!("transaction {id} to be included in a block on node {}", self.node_id),
                timeout: self.settings.block_inclusion,
            })
        }
    }

    /// Asks the node to write a snapshot of its current state.
    pub async fn create_snapshot(&self) -> HarnessResult<SnapshotFile> {
        let info = self.get_info().await?;
        let response: SnapshotResponse = self
            .endpoint
            .post("/v1/producer/create_snapshot", &EmptyRequest {})
            .await?;
        info!(
            target = "harness::node",
            node = self.node_id,
            block = response.head_block_num,
            path = %response.snapshot_name,
            "snapshot created"
        );
        Ok(SnapshotFile {
            path: PathBuf::from(response.snapshot_name),
            chain_id: info.chain_id,
            block_num: response.head_block_num,
            head_block_id: response.head_block_id,
        })
    }

    pub async fn pause_producer(&self) -> HarnessResult<()> {
        let _: ResultResponse = self.endpoint.post("/v1/producer/pause", &EmptyRequest {}).await?;
        Ok(())
    }

    pub async fn resume_producer(&self) -> HarnessResult<()> {
        let _: ResultResponse = self.endpoint.post("/v1/producer/resume", &EmptyRequest {}).await?;
        Ok(())
    }

    pub async fn is_producer_paused(&self) -> HarnessResult<bool> {
        self.endpoint.post("/v1/producer/paused", &EmptyRequest {}).await
    }

    pub async fn schedule_protocol_feature_activations(&self, features: &[String]) -> HarnessResult<()> {
        let _: ResultResponse = self
            .endpoint
            .post(
                "/v1/producer/schedule_protocol_feature_activations",
                &ProtocolFeatureActivationRequest {
                    protocol_features_to_activate: features.to_vec(),
                },
            )
            .await?;
        Ok(())
    }

    /// Raw blocks after `since`, as served to replicating peers.
    pub async fn get_blocks(&self, since: u32) -> HarnessResult<Vec<serde_json::Value>> {
        self.endpoint.post("/v1/net/blocks", &BlocksRequest { since }).await
    }
}

/// A snapshot written by a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub chain_id: String,
    pub block_num: u32,
    pub head_block_id: String,
}

impl SnapshotFile {
    pub fn read(&self) -> HarnessResult<Vec<u8>> {
        fs::read(&self.path).map_err(|err| {
            HarnessError::Io(std::io::Error::new(
                err.kind(),
                format!("failed to read snapshot {}: {err}", self.path.display()),
            ))
        })
    }

    /// Renames the file in place, `snap.json` becoming `snap<suffix>.json`,
    /// so a later snapshot of the same block does not overwrite it.
    pub fn rename_with_suffix(&mut self, suffix: &str) -> HarnessResult<()> {
        let renamed = suffixed_path(&self.path, suffix);
        fs::rename(&self.path, &renamed)?;
        debug!(target = "harness::node", from = %self.path.display(), to = %renamed.display(), "snapshot renamed");
        self.path = renamed;
        Ok(())
    }
}

fn suffixed_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> NodeClient {
        let settings = NodeClientSettings::from_config(&HarnessConfig::default());
        NodeClient::new(0, "http://127.0.0.1:1", Symbol::new("SYS", 4).expect("symbol"), settings)
            .expect("client")
    }

    #[test]
    fn duplicate_guard_rejects_identical_transfers() {
        let client = client();
        let key = TransferKey {
            from: "defproducera".to_string(),
            to: "testera11111".to_string(),
            units: 975_321,
            memo: String::new(),
        };
        client.guard_duplicate(&key).expect("first submission");
        let err = client.guard_duplicate(&key).expect_err("second submission");
        assert_eq!(err.rpc_kind(), Some(&RpcErrorKind::LocalDuplicate));

        let other = TransferKey { units: 100, ..key };
        client.guard_duplicate(&other).expect("different amount");
    }

    #[test]
    fn snapshot_suffix_keeps_extension() {
        let renamed = suffixed_path(Path::new("/tmp/snapshots/snapshot-00ab.json"), "_before_shutdown");
        assert_eq!(renamed, PathBuf::from("/tmp/snapshots/snapshot-00ab_before_shutdown.json"));
        let bare = suffixed_path(Path::new("/tmp/snapshot-00ab"), "_x");
        assert_eq!(bare, PathBuf::from("/tmp/snapshot-00ab_x"));
    }

    #[tokio::test]
    async fn unreachable_node_fails_fast_with_transport_error() {
        let err = client().get_info().await.expect_err("nothing listens on port 1");
        assert_eq!(err.rpc_kind(), Some(&RpcErrorKind::Transport));
    }

    #[tokio::test]
    async fn transfer_errors_surface_before_signing() {
        let client = client();
        let account = Account::with_single_key("testera11111", crate::keys::generate_key_pair())
            .expect("account");
        // get_info fails at the transport layer before any signing happens
        let err = client
            .transfer_funds(&account, &account, "1.0000 SYS", "", true, false)
            .await
            .expect_err("unreachable");
        assert!(matches!(err, HarnessError::Rpc(_)));

        let err = client
            .transfer_funds(&account, &account, "1.00 EOS", "", true, false)
            .await
            .expect_err("wrong symbol");
        assert!(matches!(err, HarnessError::Validation { .. }));
    }
}
