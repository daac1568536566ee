//! Typed request and response bodies for the node and wallet RPC surfaces.
//!
//! Responses are decoded into these structs at the HTTP boundary; a missing
//! field is reported as a schema error instead of surfacing later as a failed
//! lookup deep inside an assertion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{HarnessError, HarnessResult};
use crate::transaction::{Action, PermissionLevel, Transaction};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub server_version: String,
    pub chain_id: String,
    pub head_block_num: u32,
    pub head_block_id: String,
    pub head_block_time: String,
    pub head_block_producer: String,
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: String,
}

impl ChainInfo {
    pub fn validate(&self) -> HarnessResult<()> {
        if self.chain_id.is_empty() {
            return Err(schema("/v1/chain/get_info", "empty chain_id"));
        }
        if self.last_irreversible_block_num > self.head_block_num {
            return Err(schema(
                "/v1/chain/get_info",
                format!(
                    "irreversible block {} is ahead of head {}",
                    self.last_irreversible_block_num, self.head_block_num
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmptyRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetAccountRequest {
    pub account_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWeight {
    pub key: String,
    pub weight: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionLevelWeight {
    pub permission: PermissionLevel,
    pub weight: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitWeight {
    pub wait_sec: u32,
    pub weight: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub threshold: u32,
    pub keys: Vec<KeyWeight>,
    #[serde(default)]
    pub accounts: Vec<PermissionLevelWeight>,
    #[serde(default)]
    pub waits: Vec<WaitWeight>,
}

impl Authority {
    pub fn single_key(key: impl Into<String>) -> Self {
        Self {
            threshold: 1,
            keys: vec![KeyWeight {
                key: key.into(),
                weight: 1,
            }],
            accounts: Vec::new(),
            waits: Vec::new(),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.iter().any(|entry| entry.key == key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub perm_name: String,
    pub parent: String,
    pub required_auth: Authority,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResponse {
    pub account_name: String,
    #[serde(default)]
    pub ram_quota: u64,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub staked: Option<String>,
}

impl AccountResponse {
    pub fn permission(&self, name: &str) -> Option<&Permission> {
        self.permissions.iter().find(|perm| perm.perm_name == name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrencyBalanceRequest {
    pub code: String,
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequiredKeysRequest {
    pub transaction: Transaction,
    pub available_keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequiredKeysResponse {
    pub required_keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionTrace {
    pub act: Action,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTransaction {
    pub id: String,
    pub block_num: u32,
    #[serde(default)]
    pub receipt: Option<TransactionReceipt>,
    #[serde(default)]
    pub action_traces: Vec<ActionTrace>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushTransactionResponse {
    pub transaction_id: String,
    pub processed: ProcessedTransaction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionTraceRequest {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceAction {
    pub receiver: String,
    pub account: String,
    pub action: String,
    #[serde(default)]
    pub authorization: Vec<PermissionLevel>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub id: String,
    pub block_num: u32,
    pub status: String,
    pub actions: Vec<TraceAction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub head_block_id: String,
    pub head_block_num: u32,
    pub head_block_time: String,
    pub version: u32,
    pub snapshot_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolFeatureActivationRequest {
    pub protocol_features_to_activate: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub result: String,
}

impl ResultResponse {
    pub fn ok() -> Self {
        Self {
            result: "ok".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlocksRequest {
    pub since: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorDetailMessage {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub what: String,
    #[serde(default)]
    pub details: Vec<ErrorDetailMessage>,
}

/// Body of every non-2xx response from the node and wallet daemons.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: ErrorDetail,
}

impl ErrorEnvelope {
    pub fn new(status: u16, code: i64, name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code: status,
            message: if status == 404 {
                "Not Found".to_string()
            } else {
                "Internal Service Error".to_string()
            },
            error: ErrorDetail {
                code,
                name: name.to_string(),
                what: message.clone(),
                details: vec![ErrorDetailMessage { message }],
            },
        }
    }

    /// Most specific human readable description available.
    pub fn describe(&self) -> String {
        let details: Vec<&str> = self
            .error
            .details
            .iter()
            .map(|detail| detail.message.as_str())
            .filter(|message| !message.is_empty())
            .collect();
        if !details.is_empty() {
            details.join("; ")
        } else if !self.error.what.is_empty() {
            self.error.what.clone()
        } else {
            self.message.clone()
        }
    }
}

pub(crate) fn schema(endpoint: &str, message: impl Into<String>) -> HarnessError {
    HarnessError::Schema {
        endpoint: endpoint.to_string(),
        message: message.into(),
    }
}
