//! Snapshot determinism across a restart of an irreversible-mode node.
//!
//! The chain is driven into a state holding a deferred transaction and a
//! freshly promoted producer schedule, production is frozen, and the
//! irreversible reader must produce byte-identical snapshots before and after
//! it is restarted.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::account::Account;
use crate::assertions::assert_snapshots_identical;
use crate::errors::{HarnessError, HarnessResult};
use crate::keys::generate_key_pair;
use crate::node::{PushOptions, SYSTEM_ACCOUNT};
use crate::process::Signal;
use crate::rpc::types::Authority;
use crate::scenario::{Scenario, TestContext};
use crate::topology::ClusterTopology;
use crate::transaction::{Action, PermissionLevel};

const PRODUCER_NODE: usize = 0;
const IRREVERSIBLE_NODE: usize = 1;
const DEFERRED_DELAY_SECS: u32 = 600;

#[derive(Clone, Debug)]
pub struct SnapshotDeterminismScenario {
    pub topology: ClusterTopology,
    pub schedule_irreversible_timeout: Duration,
    pub relaunch_timeout: Duration,
}

impl Default for SnapshotDeterminismScenario {
    fn default() -> Self {
        Self {
            topology: ClusterTopology::new(1, 2)
                .with_node_args(IRREVERSIBLE_NODE, ["--read-mode", "irreversible"]),
            schedule_irreversible_timeout: Duration::from_secs(30),
            relaunch_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Scenario for SnapshotDeterminismScenario {
    fn name(&self) -> &'static str {
        "snapshot-determinism"
    }

    async fn run(&self, ctx: &mut TestContext) -> HarnessResult<()> {
        let cluster = &mut ctx.cluster;
        cluster.launch(self.topology.clone()).await?;
        let eosio = cluster.eosio_account()?.clone();
        let producer = cluster.node(PRODUCER_NODE)?;

        // a deferred account creation leaves a generated transaction in state
        let sample_key = generate_key_pair();
        let deferred = Action::new(
            SYSTEM_ACCOUNT,
            "newaccount",
            vec![PermissionLevel::active(&eosio.name)],
            json!({
                "creator": eosio.name,
                "name": "sample",
                "owner": Authority::single_key(&sample_key.public_key),
                "active": Authority::single_key(&sample_key.public_key),
            }),
        )?;
        producer
            .push_actions(
                vec![deferred],
                PushOptions {
                    delay_sec: DEFERRED_DELAY_SECS,
                    ..PushOptions::default()
                },
            )
            .await?;

        // a new producer schedule changes the global properties
        let new_producer = Account::with_single_key("newprod", generate_key_pair())?;
        producer
            .create_account(&new_producer, &eosio, 0, None, false)
            .await?;
        let setprods = Action::new(
            SYSTEM_ACCOUNT,
            "setprods",
            vec![PermissionLevel::active(&eosio.name)],
            json!({"schedule": [{
                "producer_name": new_producer.name,
                "block_signing_key": new_producer.active.public_key,
            }]}),
        )?;
        let record = producer.push_actions(vec![setprods], PushOptions::default()).await?;
        if !producer
            .wait_for_irreversible_block(record.block_num, self.schedule_irreversible_timeout)
            .await
        {
            warn!(
                target = "harness::scenario",
                block = record.block_num,
                "setprods block not irreversible before timeout"
            );
        }
        // freeze production so the promoted schedule stays in place
        producer.pause_producer().await?;

        cluster.kill_node(PRODUCER_NODE, Signal::Terminate).await?;

        let mut before = cluster.node(IRREVERSIBLE_NODE)?.create_snapshot().await?;
        before.rename_with_suffix("_before_shutdown")?;
        info!(target = "harness::scenario", path = %before.path.display(), "snapshot taken before restart");

        cluster.kill_node(IRREVERSIBLE_NODE, Signal::Terminate).await?;
        if !cluster.relaunch(IRREVERSIBLE_NODE, self.relaunch_timeout).await {
            return Err(HarnessError::process(
                format!("node_{IRREVERSIBLE_NODE:02}"),
                "failed to relaunch",
            ));
        }
        let after = cluster.node(IRREVERSIBLE_NODE)?.create_snapshot().await?;
        assert_snapshots_identical(&before, &after)
    }
}
