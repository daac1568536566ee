//! Transaction construction and the read-only transaction record used by assertions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::asset::Asset;
use crate::errors::{HarnessError, HarnessResult};
use crate::rpc::types::{ChainInfo, PushTransactionResponse, TransactionTrace};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionLevel {
    pub actor: String,
    pub permission: String,
}

impl PermissionLevel {
    pub fn active(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            permission: "active".to_string(),
        }
    }

    pub fn owner(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            permission: "owner".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub account: String,
    pub name: String,
    #[serde(default)]
    pub authorization: Vec<PermissionLevel>,
    #[serde(default)]
    pub data: Value,
}

impl Action {
    pub fn new(
        account: impl Into<String>,
        name: impl Into<String>,
        authorization: Vec<PermissionLevel>,
        data: impl Serialize,
    ) -> HarnessResult<Self> {
        let account = account.into();
        let name = name.into();
        let data = serde_json::to_value(data).map_err(|err| {
            HarnessError::Config(format!("cannot encode {account}::{name} data: {err}"))
        })?;
        Ok(Self {
            account,
            name,
            authorization,
            data,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub expiration: String,
    pub ref_block_num: u16,
    pub ref_block_prefix: u32,
    #[serde(default)]
    pub max_net_usage_words: u32,
    #[serde(default)]
    pub max_cpu_usage_ms: u8,
    #[serde(default)]
    pub delay_sec: u32,
    #[serde(default)]
    pub context_free_actions: Vec<Action>,
    pub actions: Vec<Action>,
}

impl Transaction {
    /// Builds a transaction whose TaPoS fields reference the last irreversible
    /// block reported in `info`, expiring `expire_in` after the head block time.
    pub fn new(info: &ChainInfo, expire_in: Duration, actions: Vec<Action>) -> HarnessResult<Self> {
        let head_time = OffsetDateTime::parse(&info.head_block_time, &Rfc3339).map_err(|err| {
            HarnessError::Schema {
                endpoint: "/v1/chain/get_info".to_string(),
                message: format!("head_block_time {:?}: {err}", info.head_block_time),
            }
        })?;
        let expiration = (head_time + expire_in).format(&Rfc3339).map_err(|err| {
            HarnessError::Config(format!("cannot format expiration: {err}"))
        })?;
        Ok(Self {
            expiration,
            ref_block_num: (info.last_irreversible_block_num & 0xffff) as u16,
            ref_block_prefix: ref_block_prefix(&info.last_irreversible_block_id)?,
            max_net_usage_words: 0,
            max_cpu_usage_ms: 0,
            delay_sec: 0,
            context_free_actions: Vec::new(),
            actions,
        })
    }

    pub fn with_delay(mut self, delay_sec: u32) -> Self {
        self.delay_sec = delay_sec;
        self
    }

    pub fn id(&self) -> String {
        hex::encode(self.id_bytes())
    }

    fn id_bytes(&self) -> [u8; 32] {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        Sha256::digest(&encoded).into()
    }

    /// Digest signed by the wallet daemon and checked by the node.
    pub fn signing_digest(&self, chain_id: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(chain_id.as_bytes());
        hasher.update(self.id_bytes());
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub context_free_data: Vec<String>,
}

impl SignedTransaction {
    pub fn id(&self) -> String {
        self.transaction.id()
    }
}

fn ref_block_prefix(block_id: &str) -> HarnessResult<u32> {
    let bytes = hex::decode(block_id).map_err(|err| HarnessError::Schema {
        endpoint: "/v1/chain/get_info".to_string(),
        message: format!("block id {block_id:?} is not hex: {err}"),
    })?;
    let word: [u8; 4] = bytes
        .get(8..12)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| HarnessError::Schema {
            endpoint: "/v1/chain/get_info".to_string(),
            message: format!("block id {block_id:?} is shorter than 12 bytes"),
        })?;
    Ok(u32::from_le_bytes(word))
}

/// One action of a fetched transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub contract: String,
    pub action: String,
    pub params: Value,
}

impl ActionRecord {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// `params.quantity` converted to integer minor units.
    pub fn quantity_units(&self) -> HarnessResult<i64> {
        let quantity = self.param_str("quantity").ok_or_else(|| HarnessError::Schema {
            endpoint: "transaction record".to_string(),
            message: format!("{}::{} has no quantity parameter", self.contract, self.action),
        })?;
        Ok(Asset::parse(quantity)?.units())
    }
}

/// Read-only view of a transaction as reported by a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub block_num: u32,
    pub actions: Vec<ActionRecord>,
}

impl TransactionRecord {
    pub fn first_action(&self) -> HarnessResult<&ActionRecord> {
        self.actions.first().ok_or_else(|| HarnessError::Schema {
            endpoint: "transaction record".to_string(),
            message: format!("transaction {} has no actions", self.id),
        })
    }
}

impl From<PushTransactionResponse> for TransactionRecord {
    fn from(response: PushTransactionResponse) -> Self {
        let actions = response
            .processed
            .action_traces
            .into_iter()
            .map(|trace| ActionRecord {
                contract: trace.act.account,
                action: trace.act.name,
                params: trace.act.data,
            })
            .collect();
        Self {
            id: response.transaction_id,
            block_num: response.processed.block_num,
            actions,
        }
    }
}

impl From<TransactionTrace> for TransactionRecord {
    fn from(trace: TransactionTrace) -> Self {
        let actions = trace
            .actions
            .into_iter()
            .map(|action| ActionRecord {
                contract: action.account,
                action: action.action,
                params: action.params,
            })
            .collect();
        Self {
            id: trace.id,
            block_num: trace.block_num,
            actions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info() -> ChainInfo {
        ChainInfo {
            server_version: "stub".to_string(),
            chain_id: "cf057bbfb72640471fd910bcb67639c22df9f92470936cddc1ade0e2f2e7dc4f"
                .to_string(),
            head_block_num: 70_000,
            head_block_id: "00011170aabbccdd0102030405060708".to_string(),
            head_block_time: "2026-10-17T10:00:00.5Z".to_string(),
            head_block_producer: "eosio".to_string(),
            last_irreversible_block_num: 65_537,
            last_irreversible_block_id: "00010001aabbccdd0102030405060708".to_string(),
        }
    }

    fn transfer() -> Action {
        Action::new(
            "eosio.token",
            "transfer",
            vec![PermissionLevel::active("defproducera")],
            json!({"from": "defproducera", "to": "testera11111", "quantity": "97.5321 SYS", "memo": ""}),
        )
        .expect("action")
    }

    #[test]
    fn tapos_fields_reference_irreversible_block() {
        let trx = Transaction::new(&info(), Duration::from_secs(30), vec![transfer()]).expect("trx");
        assert_eq!(trx.ref_block_num, 1);
        assert_eq!(trx.ref_block_prefix, u32::from_le_bytes([1, 2, 3, 4]));
        assert!(trx.expiration.starts_with("2026-10-17T10:00:30"));
    }

    #[test]
    fn id_ignores_signatures_but_tracks_content() {
        let trx = Transaction::new(&info(), Duration::from_secs(30), vec![transfer()]).expect("trx");
        let signed = SignedTransaction {
            transaction: trx.clone(),
            signatures: vec!["SIG_ED25519_00".to_string()],
            context_free_data: Vec::new(),
        };
        assert_eq!(signed.id(), trx.id());
        assert_ne!(trx.clone().with_delay(600).id(), trx.id());
        assert_ne!(trx.signing_digest("a"), trx.signing_digest("b"));
    }

    #[test]
    fn trace_converts_to_record_with_minor_units() {
        let trace: TransactionTrace = serde_json::from_value(json!({
            "id": "abc",
            "block_num": 42,
            "status": "executed",
            "actions": [{
                "receiver": "eosio.token",
                "account": "eosio.token",
                "action": "transfer",
                "params": {"from": "testera11111", "to": "currency1111", "quantity": "97.5311 SYS", "memo": "test transfer a->b"}
            }]
        }))
        .expect("trace");
        let record = TransactionRecord::from(trace);
        let action = record.first_action().expect("action");
        assert_eq!(action.action, "transfer");
        assert_eq!(action.quantity_units().expect("units"), 975_311);
    }
}
