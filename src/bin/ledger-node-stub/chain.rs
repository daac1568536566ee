//! Chain state machine of the stub node: accounts, token balances, producer
//! schedule, deferred transactions and the append-only block list.
//!
//! Every state transition is driven by applying a [`Block`], whether the block
//! was produced locally, pulled from a peer or replayed from `blocks.log`.
//! Replaying the same blocks therefore rebuilds byte-identical state.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use ledger_harness::account::validate_name;
use ledger_harness::asset::Asset;
use ledger_harness::keys::verify_digest;
use ledger_harness::rpc::types::{
    AccountResponse, ActionTrace, Authority, ChainInfo, Permission, ProcessedTransaction,
    PushTransactionResponse, SnapshotResponse, TraceAction, TransactionReceipt, TransactionTrace,
};
use ledger_harness::supervisor::Genesis;
use ledger_harness::transaction::{Action, SignedTransaction, Transaction};

pub const SYSTEM_ACCOUNT: &str = "eosio";
pub const TOKEN_CONTRACT: &str = "eosio.token";
const NULL_ACCOUNT: &str = "eosio.null";
const SNAPSHOT_VERSION: u32 = 1;
const MAX_MEMO_BYTES: usize = 256;
/// Blocks behind head that are still reversible.
const REVERSIBLE_DEPTH: u32 = 2;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("assertion failure with message: {0}")]
    Assert(String),
    #[error("missing authority of {0}")]
    MissingAuth(String),
    #[error("transaction declares authority {0} but does not have signatures for it")]
    UnsatisfiedAuth(String),
    #[error("duplicate transaction {0}")]
    Duplicate(String),
    #[error("expired transaction {id}: expiration {expiration}, head block time {head_time}")]
    Expired {
        id: String,
        expiration: String,
        head_time: String,
    },
    #[error("transaction's reference block did not match")]
    InvalidRefBlock,
    #[error("action's code {contract} does not implement {action}")]
    UnknownAction { contract: String, action: String },
    #[error("invalid {what}: {message}")]
    BadData { what: String, message: String },
    #[error("unknown key: account {0}")]
    UnknownAccount(String),
    #[error("transaction {0} not found")]
    UnknownTransaction(String),
    #[error("protocol feature {0} is not scheduled for activation")]
    FeatureNotScheduled(String),
    #[error("block {num} rejected: {reason}")]
    InvalidBlock { num: u32, reason: String },
    #[error("{0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChainError {
    /// Numeric code and exception name reported in error envelopes.
    pub fn code_and_name(&self) -> (i64, &'static str) {
        match self {
            Self::Assert(_) => (3_050_003, "eosio_assert_message_exception"),
            Self::MissingAuth(_) => (3_090_004, "missing_auth_exception"),
            Self::UnsatisfiedAuth(_) => (3_090_003, "unsatisfied_authorization"),
            Self::Duplicate(_) => (3_040_008, "tx_duplicate"),
            Self::Expired { .. } => (3_040_005, "expired_tx_exception"),
            Self::InvalidRefBlock => (3_040_007, "invalid_ref_block_exception"),
            Self::UnknownAction { .. } => (3_050_004, "action_not_found_exception"),
            Self::BadData { .. } => (3_050_002, "invalid_action_args_exception"),
            Self::UnknownAccount(_) => (3_060_002, "account_query_exception"),
            Self::UnknownTransaction(_) => (3_040_011, "tx_not_found"),
            Self::FeatureNotScheduled(_) => (3_250_000, "protocol_feature_exception"),
            Self::InvalidBlock { .. } => (3_030_000, "block_validate_exception"),
            Self::Unavailable(_) => (3_170_000, "producer_exception"),
            Self::Io(_) | Self::Serialization(_) => (0, "fc_exception"),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownAccount(_) | Self::UnknownTransaction(_))
    }

    fn assert(message: impl Into<String>) -> Self {
        Self::Assert(message.into())
    }

    fn bad_data(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::BadData {
            what: what.into(),
            message: err.to_string(),
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Queries see the head block plus transactions pending on a producer.
    Head,
    /// Queries and snapshots see the last irreversible block only.
    Irreversible,
}

impl ReadMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "head" | "speculative" => Some(Self::Head),
            "irreversible" => Some(Self::Irreversible),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Executed,
    Delayed,
}

impl TransactionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Delayed => "delayed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub id: String,
    pub status: TransactionStatus,
    pub trx: SignedTransaction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_num: u32,
    pub id: String,
    pub previous: String,
    pub timestamp: String,
    pub producer: String,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
    #[serde(default)]
    pub deferred_executed: Vec<String>,
}

impl Block {
    fn new(
        block_num: u32,
        previous: String,
        timestamp: String,
        producer: String,
        transactions: Vec<BlockTransaction>,
        deferred_executed: Vec<String>,
    ) -> Self {
        let mut block = Self {
            block_num,
            id: String::new(),
            previous,
            timestamp,
            producer,
            transactions,
            deferred_executed,
        };
        block.id = block.compute_id();
        block
    }

    /// sha256 over the header and transaction ids, with the block number in
    /// the first four bytes.
    fn compute_id(&self) -> String {
        let ids: Vec<&str> = self.transactions.iter().map(|trx| trx.id.as_str()).collect();
        let header = serde_json::json!({
            "block_num": self.block_num,
            "previous": self.previous,
            "timestamp": self.timestamp,
            "producer": self.producer,
            "transactions": ids,
            "deferred_executed": self.deferred_executed,
        });
        let mut id: [u8; 32] = Sha256::digest(header.to_string().as_bytes()).into();
        id[..4].copy_from_slice(&self.block_num.to_be_bytes());
        hex::encode(id)
    }

    fn time(&self) -> ChainResult<OffsetDateTime> {
        parse_time(&self.timestamp)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountObject {
    pub creator: String,
    pub owner: Authority,
    pub active: Authority,
    pub ram_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staked: Option<Asset>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub issuer: String,
    pub supply: Asset,
    pub max_supply: Asset,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerKey {
    pub producer_name: String,
    pub block_signing_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeferredTransaction {
    pub sender: String,
    pub execute_after: String,
    pub transaction: Transaction,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractHashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<String>,
}

/// Everything a snapshot captures. Ordered maps keep the encoding stable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    pub accounts: BTreeMap<String, AccountObject>,
    /// Account name to symbol code to balance.
    pub balances: BTreeMap<String, BTreeMap<String, Asset>>,
    pub tokens: BTreeMap<String, TokenStats>,
    pub producer_schedule: Vec<ProducerKey>,
    pub schedule_version: u32,
    pub activated_features: BTreeSet<String>,
    pub deferred: BTreeMap<String, DeferredTransaction>,
    pub contracts: BTreeMap<String, ContractHashes>,
}

#[derive(Deserialize)]
struct NewAccount {
    creator: String,
    name: String,
    owner: Authority,
    active: Authority,
}

#[derive(Deserialize)]
struct BuyRamBytes {
    payer: String,
    receiver: String,
    bytes: u64,
}

#[derive(Deserialize)]
struct DelegateBw {
    from: String,
    receiver: String,
    stake_net_quantity: Asset,
    stake_cpu_quantity: Asset,
}

#[derive(Deserialize)]
struct SetProds {
    schedule: Vec<ProducerKey>,
}

#[derive(Deserialize)]
struct Activate {
    feature_digest: String,
}

#[derive(Deserialize)]
struct SetCode {
    account: String,
    code: String,
}

#[derive(Deserialize)]
struct SetAbi {
    account: String,
    abi: String,
}

#[derive(Deserialize)]
struct TokenCreate {
    issuer: String,
    maximum_supply: Asset,
}

#[derive(Deserialize)]
struct TokenIssue {
    to: String,
    quantity: Asset,
    #[serde(default)]
    memo: String,
}

#[derive(Deserialize)]
struct TokenTransfer {
    from: String,
    to: String,
    quantity: Asset,
    #[serde(default)]
    memo: String,
}

fn decode<T: for<'de> Deserialize<'de>>(action: &Action) -> ChainResult<T> {
    serde_json::from_value(action.data.clone())
        .map_err(|err| ChainError::bad_data(format!("{}::{} data", action.account, action.name), err))
}

fn require_auth(action: &Action, actor: &str) -> ChainResult<()> {
    if action.authorization.iter().any(|level| level.actor == actor) {
        Ok(())
    } else {
        Err(ChainError::MissingAuth(actor.to_string()))
    }
}

fn check(condition: bool, message: &str) -> ChainResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ChainError::assert(message))
    }
}

impl ChainState {
    fn from_genesis(genesis: &Genesis) -> Self {
        let mut state = Self::default();
        state.accounts.insert(
            SYSTEM_ACCOUNT.to_string(),
            AccountObject {
                creator: String::new(),
                owner: Authority::single_key(&genesis.initial_key),
                active: Authority::single_key(&genesis.initial_key),
                ram_bytes: 0,
                staked: None,
            },
        );
        state
    }

    fn scheduled_producer(&self, block_num: u32) -> String {
        if self.producer_schedule.is_empty() {
            return SYSTEM_ACCOUNT.to_string();
        }
        let slot = block_num as usize % self.producer_schedule.len();
        self.producer_schedule[slot].producer_name.clone()
    }

    fn require_account(&self, name: &str) -> ChainResult<&AccountObject> {
        self.accounts
            .get(name)
            .ok_or_else(|| ChainError::assert(format!("account {name} does not exist")))
    }

    pub fn authority(&self, actor: &str, permission: &str) -> ChainResult<&Authority> {
        let account = self
            .accounts
            .get(actor)
            .ok_or_else(|| ChainError::UnsatisfiedAuth(format!("{actor}@{permission}")))?;
        match permission {
            "owner" => Ok(&account.owner),
            "active" => Ok(&account.active),
            _ => Err(ChainError::UnsatisfiedAuth(format!("{actor}@{permission}"))),
        }
    }

    pub fn balance(&self, account: &str, symbol: &str) -> Option<&Asset> {
        self.balances.get(account).and_then(|rows| rows.get(symbol))
    }

    pub fn balances_of(&self, account: &str) -> Vec<&Asset> {
        self.balances
            .get(account)
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    fn credit(&mut self, account: &str, quantity: &Asset) -> ChainResult<()> {
        let rows = self.balances.entry(account.to_string()).or_default();
        let code = quantity.symbol().code().to_string();
        let updated = match rows.get(&code) {
            Some(current) => current
                .checked_add(quantity)
                .map_err(|err| ChainError::assert(err.to_string()))?,
            None => quantity.clone(),
        };
        rows.insert(code, updated);
        Ok(())
    }

    fn debit(&mut self, account: &str, quantity: &Asset) -> ChainResult<()> {
        let code = quantity.symbol().code().to_string();
        let current = self
            .balance(account, &code)
            .cloned()
            .ok_or_else(|| ChainError::assert("no balance object found"))?;
        check(current >= *quantity, "overdrawn balance")?;
        let updated = current
            .checked_sub(quantity)
            .map_err(|err| ChainError::assert(err.to_string()))?;
        self.balances
            .entry(account.to_string())
            .or_default()
            .insert(code, updated);
        Ok(())
    }

    fn token_for(&self, quantity: &Asset) -> ChainResult<&TokenStats> {
        let stats = self
            .tokens
            .get(quantity.symbol().code())
            .ok_or_else(|| ChainError::assert("token with symbol does not exist"))?;
        check(
            stats.max_supply.symbol() == quantity.symbol(),
            "symbol precision mismatch",
        )?;
        Ok(stats)
    }

    fn apply_actions(&mut self, actions: &[Action]) -> ChainResult<()> {
        for action in actions {
            self.apply_action(action)?;
        }
        Ok(())
    }

    fn apply_action(&mut self, action: &Action) -> ChainResult<()> {
        match (action.account.as_str(), action.name.as_str()) {
            (SYSTEM_ACCOUNT, "newaccount") => {
                let data: NewAccount = decode(action)?;
                require_auth(action, &data.creator)?;
                self.require_account(&data.creator)?;
                validate_name(&data.name).map_err(|err| ChainError::bad_data("account name", err))?;
                check(
                    !self.accounts.contains_key(&data.name),
                    &format!("Cannot create account named {}, as that name is already taken", data.name),
                )?;
                self.accounts.insert(
                    data.name,
                    AccountObject {
                        creator: data.creator,
                        owner: data.owner,
                        active: data.active,
                        ram_bytes: 0,
                        staked: None,
                    },
                );
            }
            (SYSTEM_ACCOUNT, "buyrambytes") => {
                let data: BuyRamBytes = decode(action)?;
                require_auth(action, &data.payer)?;
                self.require_account(&data.payer)?;
                let receiver = self
                    .accounts
                    .get_mut(&data.receiver)
                    .ok_or_else(|| ChainError::assert(format!("account {} does not exist", data.receiver)))?;
                receiver.ram_bytes = receiver.ram_bytes.saturating_add(data.bytes);
            }
            (SYSTEM_ACCOUNT, "delegatebw") => {
                let data: DelegateBw = decode(action)?;
                require_auth(action, &data.from)?;
                self.require_account(&data.receiver)?;
                check(
                    !data.stake_net_quantity.is_negative() && !data.stake_cpu_quantity.is_negative(),
                    "must stake a positive amount",
                )?;
                let total = data
                    .stake_net_quantity
                    .checked_add(&data.stake_cpu_quantity)
                    .map_err(|err| ChainError::assert(err.to_string()))?;
                self.debit(&data.from, &total)?;
                if let Some(receiver) = self.accounts.get_mut(&data.receiver) {
                    receiver.staked = Some(match &receiver.staked {
                        Some(staked) => staked
                            .checked_add(&total)
                            .map_err(|err| ChainError::assert(err.to_string()))?,
                        None => total,
                    });
                }
            }
            (SYSTEM_ACCOUNT, "setprods") => {
                let data: SetProds = decode(action)?;
                require_auth(action, SYSTEM_ACCOUNT)?;
                for producer in &data.schedule {
                    check(
                        self.accounts.contains_key(&producer.producer_name),
                        &format!("producer {} is not a valid account", producer.producer_name),
                    )?;
                }
                self.producer_schedule = data.schedule;
                self.schedule_version += 1;
            }
            (SYSTEM_ACCOUNT, "activate") => {
                let data: Activate = decode(action)?;
                require_auth(action, SYSTEM_ACCOUNT)?;
                check(
                    data.feature_digest.len() == 64 && hex::decode(&data.feature_digest).is_ok(),
                    "feature digest must be 32 hex encoded bytes",
                )?;
                check(
                    self.activated_features.insert(data.feature_digest),
                    "protocol feature has already been activated",
                )?;
            }
            (SYSTEM_ACCOUNT, "setcode") => {
                let data: SetCode = decode(action)?;
                require_auth(action, &data.account)?;
                self.require_account(&data.account)?;
                let code = hex::decode(&data.code).map_err(|err| ChainError::bad_data("code", err))?;
                self.contracts.entry(data.account).or_default().code =
                    Some(hex::encode(Sha256::digest(&code)));
            }
            (SYSTEM_ACCOUNT, "setabi") => {
                let data: SetAbi = decode(action)?;
                require_auth(action, &data.account)?;
                self.require_account(&data.account)?;
                let abi = hex::decode(&data.abi).map_err(|err| ChainError::bad_data("abi", err))?;
                self.contracts.entry(data.account).or_default().abi =
                    Some(hex::encode(Sha256::digest(&abi)));
            }
            (TOKEN_CONTRACT, "create") => {
                let data: TokenCreate = decode(action)?;
                require_auth(action, TOKEN_CONTRACT)?;
                self.require_account(&data.issuer)?;
                check(data.maximum_supply.units() > 0, "max-supply must be positive")?;
                let code = data.maximum_supply.symbol().code().to_string();
                check(
                    !self.tokens.contains_key(&code),
                    "token with symbol already exists",
                )?;
                self.tokens.insert(
                    code,
                    TokenStats {
                        issuer: data.issuer,
                        supply: Asset::zero(data.maximum_supply.symbol().clone()),
                        max_supply: data.maximum_supply,
                    },
                );
            }
            (TOKEN_CONTRACT, "issue") => {
                let data: TokenIssue = decode(action)?;
                check(data.memo.len() <= MAX_MEMO_BYTES, "memo has more than 256 bytes")?;
                let stats = self.token_for(&data.quantity)?.clone();
                require_auth(action, &stats.issuer)?;
                self.require_account(&data.to)?;
                check(data.quantity.units() > 0, "must issue positive quantity")?;
                let supply = stats
                    .supply
                    .checked_add(&data.quantity)
                    .map_err(|err| ChainError::assert(err.to_string()))?;
                check(supply <= stats.max_supply, "quantity exceeds available supply")?;
                if let Some(entry) = self.tokens.get_mut(data.quantity.symbol().code()) {
                    entry.supply = supply;
                }
                self.credit(&data.to, &data.quantity)?;
            }
            (TOKEN_CONTRACT, "transfer") => {
                let data: TokenTransfer = decode(action)?;
                require_auth(action, &data.from)?;
                check(data.from != data.to, "cannot transfer to self")?;
                self.require_account(&data.to)
                    .map_err(|_| ChainError::assert("to account does not exist"))?;
                self.token_for(&data.quantity)?;
                check(data.quantity.units() > 0, "must transfer positive quantity")?;
                check(data.memo.len() <= MAX_MEMO_BYTES, "memo has more than 256 bytes")?;
                self.debit(&data.from, &data.quantity)?;
                self.credit(&data.to, &data.quantity)?;
            }
            (contract, action_name) => {
                return Err(ChainError::UnknownAction {
                    contract: contract.to_string(),
                    action: action_name.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Applies one block transaction at `block_time`. Delayed transactions
    /// only enter the deferred queue.
    fn apply_transaction(&mut self, trx: &BlockTransaction, block_time: OffsetDateTime) -> ChainResult<()> {
        match trx.status {
            TransactionStatus::Executed => self.apply_actions(&trx.trx.transaction.actions),
            TransactionStatus::Delayed => {
                let transaction = &trx.trx.transaction;
                let sender = transaction
                    .actions
                    .first()
                    .and_then(|action| action.authorization.first())
                    .map(|level| level.actor.clone())
                    .unwrap_or_default();
                let execute_after = format_time(
                    block_time + Duration::from_secs(u64::from(transaction.delay_sec)),
                )?;
                self.deferred.insert(
                    trx.id.clone(),
                    DeferredTransaction {
                        sender,
                        execute_after,
                        transaction: transaction.clone(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Deferred transactions due at `block_time`, in id order.
    fn due_deferred(&self, block_time: OffsetDateTime) -> Vec<String> {
        self.deferred
            .iter()
            .filter(|(_, deferred)| {
                parse_time(&deferred.execute_after).is_ok_and(|after| after <= block_time)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn apply_block(&mut self, block: &Block) -> ChainResult<()> {
        let block_time = block.time()?;
        for trx in &block.transactions {
            self.apply_transaction(trx, block_time)?;
        }
        for id in &block.deferred_executed {
            let Some(deferred) = self.deferred.remove(id) else {
                continue;
            };
            let mut trial = self.clone();
            match trial.apply_actions(&deferred.transaction.actions) {
                Ok(()) => *self = trial,
                Err(err) => debug!(id = %id, error = %err, "deferred transaction failed"),
            }
        }
        Ok(())
    }
}

/// Serialized form of a snapshot file.
#[derive(Serialize)]
struct Snapshot<'a> {
    version: u32,
    chain_id: &'a str,
    block_num: u32,
    block_id: &'a str,
    block_time: &'a str,
    state: &'a ChainState,
}

struct Pending {
    state: ChainState,
    transactions: Vec<BlockTransaction>,
}

/// Newline-delimited JSON block log.
struct BlockLog {
    file: File,
}

impl BlockLog {
    /// Opens `path`, returning the blocks it holds. A trailing partial line
    /// left by an abrupt kill is cut off.
    fn open(path: &Path) -> ChainResult<(Self, Vec<Block>)> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let mut blocks = Vec::new();
        let mut valid_len = 0usize;
        for line in content.split_inclusive(|byte| *byte == b'\n') {
            if !line.ends_with(b"\n") {
                break;
            }
            match serde_json::from_slice::<Block>(line) {
                Ok(block) => {
                    blocks.push(block);
                    valid_len += line.len();
                }
                Err(_) => break,
            }
        }
        if valid_len < content.len() {
            warn!(
                path = %path.display(),
                kept = blocks.len(),
                dropped_bytes = content.len() - valid_len,
                "truncating partial block log tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len as u64)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((Self { file }, blocks))
    }

    fn append(&mut self, block: &Block) -> ChainResult<()> {
        let mut line = serde_json::to_vec(block)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        Ok(())
    }
}

pub struct Chain {
    chain_id: String,
    read_mode: ReadMode,
    /// `blocks[0]` is the genesis block, number 1.
    blocks: Vec<Block>,
    /// State after applying blocks up to `applied_num`.
    state: ChainState,
    applied_num: u32,
    pending: Option<Pending>,
    tx_index: BTreeMap<String, u32>,
    log: BlockLog,
    snapshots_dir: PathBuf,
}

impl Chain {
    /// Opens the chain stored in `data_dir`, seeding it from `genesis_json` on first start.
    pub fn open(data_dir: &Path, genesis_json: Option<&Path>, read_mode: ReadMode) -> ChainResult<Self> {
        fs::create_dir_all(data_dir)?;
        let stored_genesis = data_dir.join("genesis.json");
        let genesis = if stored_genesis.exists() {
            load_genesis(&stored_genesis)?
        } else {
            let source = genesis_json.ok_or_else(|| {
                ChainError::Unavailable(format!(
                    "{} has no genesis.json and no --genesis-json was given",
                    data_dir.display()
                ))
            })?;
            let genesis = load_genesis(source)?;
            fs::write(&stored_genesis, serde_json::to_vec_pretty(&genesis)?)?;
            genesis
        };
        let chain_id = hex::encode(Sha256::digest(serde_json::to_vec(&genesis)?));
        let genesis_block = Block::new(
            1,
            chain_id.clone(),
            genesis.initial_timestamp.clone(),
            SYSTEM_ACCOUNT.to_string(),
            Vec::new(),
            Vec::new(),
        );

        let (log, logged) = BlockLog::open(&data_dir.join("blocks.log"))?;
        let mut chain = Self {
            chain_id,
            read_mode,
            blocks: vec![genesis_block],
            state: ChainState::from_genesis(&genesis),
            applied_num: 1,
            pending: None,
            tx_index: BTreeMap::new(),
            log,
            snapshots_dir: data_dir.join("snapshots"),
        };
        let replayed = logged.len();
        for block in logged {
            chain.link(block)?;
        }
        chain.advance()?;
        info!(
            chain_id = %chain.chain_id,
            head = chain.head().block_num,
            replayed,
            "chain opened"
        );
        Ok(chain)
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn head(&self) -> &Block {
        // blocks always holds the genesis block
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn lib_num(&self) -> u32 {
        self.head().block_num.saturating_sub(REVERSIBLE_DEPTH).max(1)
    }

    fn block(&self, num: u32) -> Option<&Block> {
        num.checked_sub(1).and_then(|index| self.blocks.get(index as usize))
    }

    /// Enables speculative execution of pushed transactions on top of head.
    pub fn start_producing(&mut self) {
        if self.pending.is_none() {
            self.pending = Some(Pending {
                state: self.state.clone(),
                transactions: Vec::new(),
            });
        }
    }

    /// State answering queries: pending state on a producer, applied state otherwise.
    pub fn query_state(&self) -> &ChainState {
        match &self.pending {
            Some(pending) => &pending.state,
            None => &self.state,
        }
    }

    pub fn info(&self, server_version: &str) -> ChainInfo {
        let lib = self.block(self.lib_num()).unwrap_or_else(|| self.head());
        let head = match self.read_mode {
            ReadMode::Head => self.head(),
            ReadMode::Irreversible => lib,
        };
        ChainInfo {
            server_version: server_version.to_string(),
            chain_id: self.chain_id.clone(),
            head_block_num: head.block_num,
            head_block_id: head.id.clone(),
            head_block_time: head.timestamp.clone(),
            head_block_producer: head.producer.clone(),
            last_irreversible_block_num: lib.block_num,
            last_irreversible_block_id: lib.id.clone(),
        }
    }

    pub fn account(&self, name: &str) -> ChainResult<AccountResponse> {
        let account = self
            .query_state()
            .accounts
            .get(name)
            .ok_or_else(|| ChainError::UnknownAccount(name.to_string()))?;
        Ok(AccountResponse {
            account_name: name.to_string(),
            ram_quota: account.ram_bytes,
            permissions: vec![
                Permission {
                    perm_name: "owner".to_string(),
                    parent: String::new(),
                    required_auth: account.owner.clone(),
                },
                Permission {
                    perm_name: "active".to_string(),
                    parent: "owner".to_string(),
                    required_auth: account.active.clone(),
                },
            ],
            staked: account.staked.as_ref().map(ToString::to_string),
        })
    }

    pub fn currency_balance(&self, code: &str, account: &str, symbol: Option<&str>) -> Vec<String> {
        if code != TOKEN_CONTRACT {
            return Vec::new();
        }
        let state = self.query_state();
        match symbol {
            Some(symbol) => state
                .balance(account, symbol)
                .map(|asset| vec![asset.to_string()])
                .unwrap_or_default(),
            None => state
                .balances_of(account)
                .into_iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Subset of `available` needed to satisfy every declared authorization.
    pub fn required_keys(&self, transaction: &Transaction, available: &[String]) -> ChainResult<Vec<String>> {
        let state = self.query_state();
        let mut required = BTreeSet::new();
        for action in &transaction.actions {
            for level in &action.authorization {
                let keys = satisfying_keys(state, &level.actor, &level.permission, |key| {
                    available.iter().any(|candidate| candidate == key)
                })?;
                required.extend(keys);
            }
        }
        Ok(required.into_iter().collect())
    }

    /// Validates `signed` against pending state and queues it for the next block.
    pub fn push_transaction(&mut self, signed: SignedTransaction) -> ChainResult<PushTransactionResponse> {
        let id = signed.id();
        let head_num = self.head().block_num;
        let head_time = self.head().time()?;
        let transaction = &signed.transaction;

        let expiration = parse_time(&transaction.expiration)?;
        if expiration <= head_time {
            return Err(ChainError::Expired {
                id,
                expiration: transaction.expiration.clone(),
                head_time: self.head().timestamp.clone(),
            });
        }
        self.check_tapos(transaction)?;
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| ChainError::Unavailable("node is not producing".to_string()))?;
        if self.tx_index.contains_key(&id) || pending.transactions.iter().any(|trx| trx.id == id) {
            return Err(ChainError::Duplicate(id));
        }
        let digest = transaction.signing_digest(&self.chain_id);
        for action in &transaction.actions {
            for level in &action.authorization {
                satisfying_keys(&pending.state, &level.actor, &level.permission, |key| {
                    signed
                        .signatures
                        .iter()
                        .any(|signature| verify_digest(key, &digest, signature))
                })?;
            }
        }
        for action in &transaction.context_free_actions {
            if action.account != NULL_ACCOUNT || !action.authorization.is_empty() {
                return Err(ChainError::bad_data(
                    "context free action",
                    format!("{}::{} is not allowed", action.account, action.name),
                ));
            }
        }

        let status = if transaction.delay_sec > 0 {
            TransactionStatus::Delayed
        } else {
            TransactionStatus::Executed
        };
        let block_trx = BlockTransaction {
            id: id.clone(),
            status,
            trx: signed,
        };
        let mut state = pending.state.clone();
        state.apply_transaction(&block_trx, head_time)?;

        let action_traces = block_trx
            .trx
            .transaction
            .actions
            .iter()
            .cloned()
            .map(|act| ActionTrace { act })
            .collect();
        if let Some(pending) = self.pending.as_mut() {
            pending.state = state;
            pending.transactions.push(block_trx);
        }
        debug!(id = %id, status = status.as_str(), "transaction accepted");
        Ok(PushTransactionResponse {
            transaction_id: id.clone(),
            processed: ProcessedTransaction {
                id,
                block_num: head_num + 1,
                receipt: Some(TransactionReceipt {
                    status: status.as_str().to_string(),
                }),
                action_traces,
            },
        })
    }

    fn check_tapos(&self, transaction: &Transaction) -> ChainResult<()> {
        let matches = self.blocks.iter().rev().any(|block| {
            (block.block_num & 0xffff) as u16 == transaction.ref_block_num
                && block_prefix(&block.id) == Some(transaction.ref_block_prefix)
        });
        if matches {
            Ok(())
        } else {
            Err(ChainError::InvalidRefBlock)
        }
    }

    /// Seals pending transactions into a new block at `now`.
    pub fn produce_block(&mut self, now: OffsetDateTime) -> ChainResult<Block> {
        let head = self.head();
        let head_time = head.time()?;
        let block_time = if now > head_time {
            now
        } else {
            head_time + Duration::from_millis(1)
        };
        let block_num = head.block_num + 1;
        let previous = head.id.clone();
        let pending = self.pending.take();
        let transactions = pending.map(|pending| pending.transactions).unwrap_or_default();
        let deferred_executed = self.state.due_deferred(block_time);
        let producer = self.state.scheduled_producer(block_num);
        let block = Block::new(
            block_num,
            previous,
            format_time(block_time)?,
            producer,
            transactions,
            deferred_executed,
        );
        let outcome = self.accept_block(block.clone());
        self.start_producing();
        outcome.map(|()| block)
    }

    /// Appends a block received from a peer. Blocks at or below head are ignored.
    pub fn accept_block(&mut self, block: Block) -> ChainResult<()> {
        if block.block_num <= self.head().block_num {
            return Ok(());
        }
        self.link(block.clone())?;
        self.log.append(&block)?;
        self.advance()
    }

    /// Validates `block` against head and records it without applying state.
    fn link(&mut self, block: Block) -> ChainResult<()> {
        let head = self.head();
        let reject = |reason: String| ChainError::InvalidBlock {
            num: block.block_num,
            reason,
        };
        if block.block_num != head.block_num + 1 {
            return Err(reject(format!("expected block {}", head.block_num + 1)));
        }
        if block.previous != head.id {
            return Err(reject(format!("previous {} does not match head {}", block.previous, head.id)));
        }
        if block.compute_id() != block.id {
            return Err(reject("id does not match contents".to_string()));
        }
        for trx in &block.transactions {
            self.tx_index.insert(trx.id.clone(), block.block_num);
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Applies linked blocks up to head, or up to the irreversible block in
    /// irreversible mode.
    fn advance(&mut self) -> ChainResult<()> {
        let target = match self.read_mode {
            ReadMode::Head => self.head().block_num,
            ReadMode::Irreversible => self.lib_num(),
        };
        while self.applied_num < target {
            let next = self.applied_num + 1;
            let block = self
                .block(next)
                .ok_or_else(|| ChainError::InvalidBlock {
                    num: next,
                    reason: "block is not linked".to_string(),
                })?
                .clone();
            let mut state = self.state.clone();
            state.apply_block(&block).map_err(|err| ChainError::InvalidBlock {
                num: next,
                reason: err.to_string(),
            })?;
            self.state = state;
            self.applied_num = next;
        }
        Ok(())
    }

    /// Up to `limit` blocks following `since`.
    pub fn blocks_since(&self, since: u32, limit: usize) -> Vec<Block> {
        self.blocks
            .iter()
            .skip(since as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn trace(&self, id: &str) -> ChainResult<TransactionTrace> {
        let not_found = || ChainError::UnknownTransaction(id.to_string());
        let block_num = *self.tx_index.get(id).ok_or_else(not_found)?;
        let block = self.block(block_num).ok_or_else(not_found)?;
        let trx = block
            .transactions
            .iter()
            .find(|trx| trx.id == id)
            .ok_or_else(not_found)?;
        let actions = trx
            .trx
            .transaction
            .actions
            .iter()
            .map(|action| TraceAction {
                receiver: action.account.clone(),
                account: action.account.clone(),
                action: action.name.clone(),
                authorization: action.authorization.clone(),
                params: action.data.clone(),
            })
            .collect();
        Ok(TransactionTrace {
            id: id.to_string(),
            block_num,
            status: trx.status.as_str().to_string(),
            actions,
        })
    }

    /// Writes the applied state and the block it corresponds to.
    pub fn write_snapshot(&self) -> ChainResult<SnapshotResponse> {
        let block = self
            .block(self.applied_num)
            .ok_or_else(|| ChainError::Unavailable("no applied block".to_string()))?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            chain_id: &self.chain_id,
            block_num: block.block_num,
            block_id: &block.id,
            block_time: &block.timestamp,
            state: &self.state,
        };
        fs::create_dir_all(&self.snapshots_dir)?;
        let path = self.snapshots_dir.join(format!("snapshot-{}.json", block.id));
        fs::write(&path, serde_json::to_vec_pretty(&snapshot)?)?;
        let path = fs::canonicalize(&path)?;
        info!(block = block.block_num, path = %path.display(), "snapshot written");
        Ok(SnapshotResponse {
            head_block_id: block.id.clone(),
            head_block_num: block.block_num,
            head_block_time: block.timestamp.clone(),
            version: SNAPSHOT_VERSION,
            snapshot_name: path.display().to_string(),
        })
    }
}

/// Keys accepted by `accepts` that satisfy `actor@permission`. An active
/// permission may also be satisfied by the owner permission.
fn satisfying_keys(
    state: &ChainState,
    actor: &str,
    permission: &str,
    accepts: impl Fn(&str) -> bool,
) -> ChainResult<Vec<String>> {
    let mut candidates = vec![permission];
    if permission == "active" {
        candidates.push("owner");
    }
    for candidate in candidates {
        let authority = state.authority(actor, candidate)?;
        let mut weight = 0u32;
        let mut keys = Vec::new();
        for entry in &authority.keys {
            if accepts(entry.key.as_str()) {
                weight += u32::from(entry.weight);
                keys.push(entry.key.clone());
                if weight >= authority.threshold {
                    return Ok(keys);
                }
            }
        }
    }
    Err(ChainError::UnsatisfiedAuth(format!("{actor}@{permission}")))
}

fn block_prefix(block_id: &str) -> Option<u32> {
    let bytes = hex::decode(block_id).ok()?;
    let word: [u8; 4] = bytes.get(8..12)?.try_into().ok()?;
    Some(u32::from_le_bytes(word))
}

fn load_genesis(path: &Path) -> ChainResult<Genesis> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

fn parse_time(value: &str) -> ChainResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|err| ChainError::bad_data(format!("timestamp {value:?}"), err))
}

pub fn format_time(value: OffsetDateTime) -> ChainResult<String> {
    value
        .format(&Rfc3339)
        .map_err(|err| ChainError::bad_data("timestamp", err))
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use serde_json::json;

    use super::*;
    use ledger_harness::config::DEFAULT_EOSIO_PRIVATE_KEY;
    use ledger_harness::keys::{public_key_of, sign_digest};
    use ledger_harness::transaction::PermissionLevel;

    fn genesis_file(dir: &Path) -> PathBuf {
        let path = dir.join("genesis.json");
        let key = public_key_of(DEFAULT_EOSIO_PRIVATE_KEY).expect("key");
        Genesis::new(key).expect("genesis").save(&path).expect("save");
        path
    }

    fn action(contract: &str, name: &str, actor: &str, data: serde_json::Value) -> Action {
        Action::new(contract, name, vec![PermissionLevel::active(actor)], data).expect("action")
    }

    fn signed(chain: &Chain, actions: Vec<Action>) -> SignedTransaction {
        let info = chain.info("test");
        let transaction = Transaction::new(&info, StdDuration::from_secs(30), actions).expect("trx");
        let digest = transaction.signing_digest(chain.chain_id());
        SignedTransaction {
            signatures: vec![sign_digest(DEFAULT_EOSIO_PRIVATE_KEY, &digest).expect("sign")],
            transaction,
            context_free_data: Vec::new(),
        }
    }

    fn newaccount(name: &str) -> Action {
        let key = public_key_of(DEFAULT_EOSIO_PRIVATE_KEY).expect("key");
        action(
            SYSTEM_ACCOUNT,
            "newaccount",
            SYSTEM_ACCOUNT,
            json!({
                "creator": SYSTEM_ACCOUNT,
                "name": name,
                "owner": Authority::single_key(&key),
                "active": Authority::single_key(&key),
            }),
        )
    }

    fn produce(chain: &mut Chain, count: usize) {
        for _ in 0..count {
            chain
                .produce_block(OffsetDateTime::now_utc())
                .expect("produce");
        }
    }

    #[test]
    fn replay_rebuilds_identical_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = genesis_file(dir.path());
        let data = dir.path().join("data");

        let mut chain = Chain::open(&data, Some(&genesis), ReadMode::Head).expect("open");
        chain.start_producing();
        let trx = signed(&chain, vec![newaccount("alice")]);
        chain.push_transaction(trx.clone()).expect("push");
        let err = chain.push_transaction(trx).expect_err("same id twice");
        assert_eq!(err.code_and_name().1, "tx_duplicate");
        produce(&mut chain, 3);
        let first = chain.write_snapshot().expect("snapshot");
        let before = fs::read(&first.snapshot_name).expect("read");
        drop(chain);

        let reopened = Chain::open(&data, None, ReadMode::Head).expect("reopen");
        assert_eq!(reopened.head().block_num, 4);
        assert!(reopened.account("alice").is_ok());
        let second = reopened.write_snapshot().expect("snapshot");
        assert_eq!(second.head_block_id, first.head_block_id);
        assert_eq!(fs::read(&second.snapshot_name).expect("read"), before);
    }

    #[test]
    fn unsigned_transaction_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = genesis_file(dir.path());
        let mut chain = Chain::open(&dir.path().join("data"), Some(&genesis), ReadMode::Head).expect("open");
        chain.start_producing();
        let mut trx = signed(&chain, vec![newaccount("bob")]);
        trx.signatures.clear();
        let err = chain.push_transaction(trx).expect_err("no signature");
        assert!(matches!(err, ChainError::UnsatisfiedAuth(_)), "{err}");
    }

    #[test]
    fn transfer_beyond_balance_is_overdrawn() {
        let key = public_key_of(DEFAULT_EOSIO_PRIVATE_KEY).expect("key");
        let mut state = ChainState::from_genesis(&Genesis::new(key).expect("genesis"));
        for name in [TOKEN_CONTRACT, "alice"] {
            state.apply_action(&newaccount(name)).expect("account");
        }
        state
            .apply_action(&action(
                TOKEN_CONTRACT,
                "create",
                TOKEN_CONTRACT,
                json!({"issuer": SYSTEM_ACCOUNT, "maximum_supply": "1000.0000 SYS"}),
            ))
            .expect("create");
        state
            .apply_action(&action(
                TOKEN_CONTRACT,
                "issue",
                SYSTEM_ACCOUNT,
                json!({"to": SYSTEM_ACCOUNT, "quantity": "100.0000 SYS", "memo": ""}),
            ))
            .expect("issue");
        state
            .apply_action(&action(
                TOKEN_CONTRACT,
                "transfer",
                SYSTEM_ACCOUNT,
                json!({"from": SYSTEM_ACCOUNT, "to": "alice", "quantity": "1.0000 SYS", "memo": ""}),
            ))
            .expect("transfer");
        assert_eq!(
            state.balance("alice", "SYS").map(ToString::to_string).as_deref(),
            Some("1.0000 SYS")
        );

        let err = state
            .apply_action(&action(
                TOKEN_CONTRACT,
                "transfer",
                "alice",
                json!({"from": "alice", "to": SYSTEM_ACCOUNT, "quantity": "2.0000 SYS", "memo": ""}),
            ))
            .expect_err("overdrawn");
        assert!(err.to_string().contains("overdrawn balance"), "{err}");

        let err = state
            .apply_action(&action(
                TOKEN_CONTRACT,
                "transfer",
                SYSTEM_ACCOUNT,
                json!({"from": "alice", "to": SYSTEM_ACCOUNT, "quantity": "0.5000 SYS", "memo": ""}),
            ))
            .expect_err("wrong authority");
        assert!(matches!(err, ChainError::MissingAuth(_)), "{err}");
    }

    #[test]
    fn partial_log_tail_is_dropped_on_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = genesis_file(dir.path());
        let data = dir.path().join("data");
        let mut chain = Chain::open(&data, Some(&genesis), ReadMode::Head).expect("open");
        chain.start_producing();
        produce(&mut chain, 2);
        drop(chain);

        let log = data.join("blocks.log");
        let intact = fs::read(&log).expect("log");
        let mut torn = intact.clone();
        torn.extend_from_slice(b"{\"block_num\":4,\"id\":");
        fs::write(&log, torn).expect("tear");

        let reopened = Chain::open(&data, None, ReadMode::Head).expect("reopen");
        assert_eq!(reopened.head().block_num, 3);
        assert_eq!(fs::read(&log).expect("log"), intact);
    }

    #[test]
    fn irreversible_reader_lags_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = genesis_file(dir.path());
        let mut producer = Chain::open(&dir.path().join("a"), Some(&genesis), ReadMode::Head).expect("open");
        producer.start_producing();
        produce(&mut producer, 5);

        let mut reader =
            Chain::open(&dir.path().join("b"), Some(&genesis), ReadMode::Irreversible).expect("open");
        for block in producer.blocks_since(1, 100) {
            reader.accept_block(block).expect("accept");
        }
        let info = reader.info("test");
        assert_eq!(info.head_block_num, 4);
        assert_eq!(info.last_irreversible_block_num, 4);
        assert_eq!(producer.info("test").head_block_num, 6);
        assert_eq!(reader.chain_id(), producer.chain_id());
    }
}
