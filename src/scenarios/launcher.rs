//! Launch a producer cluster, create and fund accounts, then bounce and take
//! down nodes while re-validating chain state after every disruption.

use async_trait::async_trait;
use tracing::info;

use crate::assertions::{assert_balance, assert_transfer_action};
use crate::cluster::Cluster;
use crate::errors::{HarnessError, HarnessResult};
use crate::scenario::{Scenario, TestContext};
use crate::topology::ClusterTopology;

const TEST_WALLET: &str = "test";
const PRODUCER_WALLET: &str = "defproducera";
const CURRENCY_DEPOSIT_UNITS: i64 = 5_000;
const USER_RAM_BYTES: u64 = 1_000_000;

#[derive(Clone, Debug)]
pub struct LauncherScenario {
    pub topology: ClusterTopology,
}

impl Default for LauncherScenario {
    fn default() -> Self {
        Self {
            topology: ClusterTopology::new(4, 4),
        }
    }
}

#[async_trait]
impl Scenario for LauncherScenario {
    fn name(&self) -> &'static str {
        "launcher"
    }

    async fn run(&self, ctx: &mut TestContext) -> HarnessResult<()> {
        if self.topology.total_nodes < 3 {
            return Err(HarnessError::Config(
                "launcher scenario bounces and downs nodes 0-2 and needs three nodes".to_string(),
            ));
        }
        let cluster = &mut ctx.cluster;
        cluster.launch(self.topology.clone()).await?;

        info!(target = "harness::scenario", "validating system accounts after bootstrap");
        cluster.validate_accounts(None).await?;

        let mut accounts = Cluster::create_account_keys(3)?;
        accounts[0].rename("testera11111")?;
        accounts[1].rename("currency1111")?;
        accounts[2].rename("exchange1111")?;
        // testera and currency share exchange's active key; exchange takes currency's owner key
        let shared_active = accounts[2].active.clone();
        accounts[0].active = shared_active.clone();
        accounts[1].active = shared_active;
        accounts[2].owner = accounts[1].owner.clone();
        accounts[1].ram_bytes = USER_RAM_BYTES;
        accounts[2].ram_bytes = USER_RAM_BYTES;

        let eosio = cluster.eosio_account()?.clone();
        let defproducera = cluster.defproducera_account()?.clone();
        let wallet = cluster
            .wallets()
            .create(TEST_WALLET, &[eosio.clone(), defproducera.clone()])
            .await?;
        for account in &accounts {
            if !cluster.wallets().import_key(account, &wallet.name).await? {
                return Err(HarnessError::Wallet(format!(
                    "no keys to import for {}",
                    account.name
                )));
            }
        }
        let producer_wallet = cluster.wallets().create(PRODUCER_WALLET, &[]).await?;
        if !cluster.wallets().import_key(&defproducera, &producer_wallet.name).await? {
            return Err(HarnessError::Wallet("no keys to import for defproducera".to_string()));
        }

        cluster.validate_accounts(None).await?;

        let symbol = cluster.config().chain.core_symbol()?;
        let amount = |value: &str| format!("{value} {}", symbol.code());
        let (testera, currency, exchange) = (&accounts[0], &accounts[1], &accounts[2]);
        {
            let node = cluster.node(0)?;
            node.create_initialize_account(testera, &eosio, 0, false).await?;
            node.create_initialize_account(currency, &eosio, CURRENCY_DEPOSIT_UNITS, true)
                .await?;
            node.create_initialize_account(exchange, &eosio, 0, true).await?;
        }
        cluster.validate_accounts(Some(&accounts)).await?;

        let node = cluster.node(0)?;
        if !node.verify_account(testera).await? {
            return Err(HarnessError::validation(
                format!("account {}", testera.name),
                "created with the generated keys",
                "missing or different keys",
            ));
        }

        node.transfer_funds(&defproducera, testera, &amount("97.5321"), "test transfer", false, true)
            .await?;
        assert_balance(node, &testera.name, &amount("97.5321")).await?;

        node.transfer_funds(&defproducera, testera, &amount("0.0100"), "test transfer", true, true)
            .await?;
        assert_balance(node, &testera.name, &amount("97.5421")).await?;

        cluster.validate_accounts(Some(&accounts)).await?;

        let node = cluster.node(0)?;
        let record = node
            .transfer_funds(testera, currency, &amount("97.5311"), "test transfer a->b", false, true)
            .await?;
        // 5000 minor units of initial deposit plus the transfer
        assert_balance(node, &currency.name, &amount("98.0311")).await?;

        if !node
            .wait_for_transaction_in_block(&record.id, node.settings().block_inclusion)
            .await
        {
            return Err(HarnessError::Timeout {
                what: format!("transaction {} to be included in a block", record.id),
                timeout: node.settings().block_inclusion,
            });
        }
        let fetched = node.get_transaction(&record.id, false).await?;
        assert_transfer_action(&fetched, "transfer", 975_311)?;

        info!(target = "harness::scenario", "bouncing nodes 0 and 1");
        cluster.bounce(&[0, 1]).await?;
        info!(target = "harness::scenario", "taking down node 2");
        cluster.down(&[2]).await?;
        info!(target = "harness::scenario", "bouncing node 2 back up");
        cluster.bounce(&[2]).await?;

        cluster.check_logs_for_asserts(0)?;
        cluster.validate_accounts(Some(&accounts)).await?;
        Ok(())
    }
}
