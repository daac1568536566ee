//! Chain bootstrap run against node 0 right after launch: protocol features,
//! system accounts, optional contracts, the core token, producer accounts and
//! the producer schedule.

use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use crate::account::Account;
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::keys::KeyPair;
use crate::node::{NodeClient, PushOptions, SYSTEM_ACCOUNT, TOKEN_CONTRACT};
use crate::topology::ClusterTopology;
use crate::transaction::{Action, PermissionLevel};

pub const SYSTEM_ACCOUNTS: &[&str] = &[
    "eosio.bpay",
    "eosio.msig",
    "eosio.names",
    "eosio.ram",
    "eosio.ramfee",
    "eosio.saving",
    "eosio.stake",
    "eosio.token",
    "eosio.vpay",
    "eosio.rex",
];

/// Accounts that exist once bootstrap has completed.
#[derive(Clone, Debug)]
pub struct BootstrapAccounts {
    pub eosio: Account,
    pub system: Vec<Account>,
    pub producers: Vec<Account>,
}

impl BootstrapAccounts {
    /// Every bootstrap account, `eosio` first.
    pub fn all(&self) -> Vec<Account> {
        let mut accounts = Vec::with_capacity(1 + self.system.len() + self.producers.len());
        accounts.push(self.eosio.clone());
        accounts.extend(self.system.iter().cloned());
        accounts.extend(self.producers.iter().cloned());
        accounts
    }
}

/// Accounts bootstrap is going to create, without touching the chain.
pub fn planned_accounts(config: &HarnessConfig, topology: &ClusterTopology) -> HarnessResult<BootstrapAccounts> {
    let keys = config.chain.eosio_keys()?;
    let build = |name: &str| Account::with_single_key(name, keys.clone());
    Ok(BootstrapAccounts {
        eosio: build(SYSTEM_ACCOUNT)?,
        system: SYSTEM_ACCOUNTS.iter().map(|name| build(*name)).collect::<HarnessResult<_>>()?,
        producers: topology
            .all_producers()
            .iter()
            .map(|name| build(name.as_str()))
            .collect::<HarnessResult<_>>()?,
    })
}

/// Drives the bootstrap sequence through `client`, which must sign with the `eosio` key.
pub async fn bootstrap(
    client: &NodeClient,
    config: &HarnessConfig,
    topology: &ClusterTopology,
) -> HarnessResult<BootstrapAccounts> {
    let accounts = planned_accounts(config, topology)?;
    let eosio = &accounts.eosio;

    if !config.chain.protocol_features.is_empty() {
        activate_protocol_features(client, &config.chain.protocol_features).await?;
    }

    for account in &accounts.system {
        client.create_account(account, eosio, 0, None, false).await?;
    }
    info!(target = "harness::bootstrap", count = accounts.system.len(), "system accounts created");

    if let Some(contracts_dir) = &config.paths.contracts_dir {
        deploy_contract(client, contracts_dir, TOKEN_CONTRACT, TOKEN_CONTRACT).await?;
        if config.chain.load_system_contract {
            deploy_contract(client, contracts_dir, "eosio.system", SYSTEM_ACCOUNT).await?;
        }
    }

    let max_supply = config.chain.asset(config.chain.max_supply)?;
    let initial_issue = config.chain.asset(config.chain.initial_issue)?;
    push_eosio(
        client,
        TOKEN_CONTRACT,
        "create",
        PermissionLevel::active(TOKEN_CONTRACT),
        json!({"issuer": SYSTEM_ACCOUNT, "maximum_supply": max_supply}),
    )
    .await?;
    push_eosio(
        client,
        TOKEN_CONTRACT,
        "issue",
        PermissionLevel::active(SYSTEM_ACCOUNT),
        json!({"to": SYSTEM_ACCOUNT, "quantity": initial_issue, "memo": "initial issue"}),
    )
    .await?;
    info!(target = "harness::bootstrap", supply = %max_supply, issued = %initial_issue, "core token created");

    for producer in &accounts.producers {
        client.create_account(producer, eosio, 0, None, false).await?;
    }
    set_producers(client, &accounts.producers, &config.chain.eosio_keys()?).await?;

    let funding = config.chain.asset(config.chain.producer_funding)?;
    let mut last_id = None;
    for producer in &accounts.producers {
        let record = client
            .transfer_funds(eosio, producer, &funding.to_string(), "producer funding", true, false)
            .await?;
        last_id = Some(record.id);
    }

    if let Some(id) = last_id {
        if !client
            .wait_for_transaction_in_block(&id, client.settings().block_inclusion)
            .await
        {
            return Err(HarnessError::Timeout {
                what: "bootstrap transactions to be included in a block".to_string(),
                timeout: client.settings().block_inclusion,
            });
        }
    }
    info!(
        target = "harness::bootstrap",
        producers = accounts.producers.len(),
        funding = %funding,
        "bootstrap complete"
    );
    Ok(accounts)
}

async fn activate_protocol_features(client: &NodeClient, features: &[String]) -> HarnessResult<()> {
    client.schedule_protocol_feature_activations(features).await?;
    let actions = features
        .iter()
        .map(|digest| {
            Action::new(
                SYSTEM_ACCOUNT,
                "activate",
                vec![PermissionLevel::active(SYSTEM_ACCOUNT)],
                json!({"feature_digest": digest}),
            )
        })
        .collect::<HarnessResult<Vec<_>>>()?;
    client
        .push_actions(
            actions,
            PushOptions {
                wait_for_block: true,
                ..PushOptions::default()
            },
        )
        .await?;
    info!(target = "harness::bootstrap", count = features.len(), "protocol features activated");
    Ok(())
}

/// Uploads `<dir>/<contract>/<contract>.wasm` and `.abi` to `account`.
async fn deploy_contract(client: &NodeClient, dir: &Path, contract: &str, account: &str) -> HarnessResult<()> {
    let base = dir.join(contract);
    let code = fs::read(base.join(format!("{contract}.wasm")))?;
    let abi = fs::read(base.join(format!("{contract}.abi")))?;
    let auth = vec![PermissionLevel::active(account)];
    let actions = vec![
        Action::new(
            SYSTEM_ACCOUNT,
            "setcode",
            auth.clone(),
            json!({"account": account, "vmtype": 0, "vmversion": 0, "code": hex::encode(code)}),
        )?,
        Action::new(
            SYSTEM_ACCOUNT,
            "setabi",
            auth,
            json!({"account": account, "abi": hex::encode(abi)}),
        )?,
    ];
    client
        .push_actions(
            actions,
            PushOptions {
                wait_for_block: true,
                ..PushOptions::default()
            },
        )
        .await?;
    info!(target = "harness::bootstrap", contract, account, "contract deployed");
    Ok(())
}

async fn set_producers(client: &NodeClient, producers: &[Account], signing_key: &KeyPair) -> HarnessResult<()> {
    let schedule: Vec<Value> = producers
        .iter()
        .map(|producer| {
            json!({"producer_name": producer.name, "block_signing_key": signing_key.public_key})
        })
        .collect();
    push_eosio(
        client,
        SYSTEM_ACCOUNT,
        "setprods",
        PermissionLevel::active(SYSTEM_ACCOUNT),
        json!({ "schedule": schedule }),
    )
    .await
}

async fn push_eosio(
    client: &NodeClient,
    contract: &str,
    action: &str,
    auth: PermissionLevel,
    data: Value,
) -> HarnessResult<()> {
    let action = Action::new(contract, action, vec![auth], data)?;
    client.push_actions(vec![action], PushOptions::default()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_accounts_cover_system_and_producers() {
        let mut config = HarnessConfig::default();
        config.topology.producer_nodes = 2;
        config.topology.total_nodes = 3;
        let topology = config.topology.to_topology().expect("topology");
        let accounts = planned_accounts(&config, &topology).expect("accounts");

        assert_eq!(accounts.eosio.name, "eosio");
        assert_eq!(accounts.system.len(), SYSTEM_ACCOUNTS.len());
        let producers: Vec<_> = accounts.producers.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(producers, ["defproducera", "defproducerb"]);
        assert_eq!(accounts.all().len(), 1 + SYSTEM_ACCOUNTS.len() + 2);
        assert!(accounts.all().iter().all(|account| account.owner == accounts.eosio.owner));
    }
}
