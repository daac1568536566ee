use std::time::Duration;

use anyhow::{ensure, Result};

#[path = "support/mod.rs"]
mod support;

use ledger_harness::assertions::{assert_balance, assert_transfer_action};
use ledger_harness::cluster::IGNITION_WALLET;
use ledger_harness::process::Signal;
use ledger_harness::{Asset, Cluster, ClusterState, ClusterTopology, NodeClient};

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads the node's last irreversible block and checks it never moved backwards.
async fn observe_finality(node: &NodeClient, last: &mut u32) -> Result<()> {
    let lib = node.get_irreversible_block_num().await?;
    ensure!(
        lib >= *last,
        "node {} irreversible block went back from {} to {lib}",
        node.node_id(),
        *last
    );
    *last = lib;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn funds_move_and_replicate_across_bounces() -> Result<()> {
    support::init_tracing();
    let dir = tempfile::tempdir()?;
    let mut cluster = Cluster::new(support::stub_config(dir.path()))?;
    cluster
        .launch(ClusterTopology::new(1, 3).with_common_args(support::FAST_BLOCKS))
        .await?;
    assert_eq!(cluster.state(), ClusterState::Running);
    cluster.validate_accounts(None).await?;

    let mut accounts = Cluster::create_account_keys(1)?;
    accounts[0].rename("alice1111111")?;
    let alice = accounts[0].clone();
    let eosio = cluster.eosio_account()?.clone();
    let producer = cluster.defproducera_account()?.clone();
    cluster
        .wallets()
        .create("test", &[eosio.clone(), producer.clone(), alice.clone()])
        .await?;

    let node = cluster.node(0)?;
    node.create_initialize_account(&alice, &eosio, 0, true).await?;
    let producer_before = node.get_account_asset(&producer.name).await?;
    let record = node
        .transfer_funds(&producer, &alice, "10.0000 SYS", "first", false, true)
        .await?;
    assert_balance(node, &alice.name, "10.0000 SYS").await?;
    let sent = Asset::parse("10.0000 SYS")?;
    assert_eq!(
        node.get_account_asset(&producer.name).await?,
        producer_before.checked_sub(&sent)?
    );

    // a second identical transfer inside the expiration window is refused locally
    let duplicate = node
        .transfer_funds(&producer, &alice, "10.0000 SYS", "first", false, true)
        .await
        .expect_err("identical transfer must be refused");
    assert!(duplicate.to_string().contains("already submitted"), "{duplicate}");
    node.transfer_funds(&producer, &alice, "10.0000 SYS", "first", true, true)
        .await?;
    assert_balance(node, &alice.name, "20.0000 SYS").await?;

    let overdraw = node
        .transfer_funds(&alice, &producer, "1000.0000 SYS", "too much", false, false)
        .await
        .expect_err("overdraw must be rejected");
    assert!(overdraw.to_string().contains("overdrawn balance"), "{overdraw}");

    let fetched = node.get_transaction(&record.id, true).await?;
    assert_transfer_action(&fetched, "transfer", 100_000)?;

    // a non-producing node follows the producer
    let follower = cluster.node(2)?;
    let head = cluster.node(0)?.get_head_block_num().await?;
    ensure!(
        follower.wait_for_head_block(head, SYNC_TIMEOUT).await,
        "node 2 did not reach block {head}"
    );
    assert_balance(follower, &alice.name, "20.0000 SYS").await?;

    let mut producer_lib = 0;
    let mut relay_lib = 0;
    observe_finality(cluster.node(0)?, &mut producer_lib).await?;
    observe_finality(cluster.node(1)?, &mut relay_lib).await?;
    cluster.bounce(&[1]).await?;
    observe_finality(cluster.node(1)?, &mut relay_lib).await?;
    observe_finality(cluster.node(0)?, &mut producer_lib).await?;
    ensure!(
        cluster.node(1)?.wait_for_irreversible_block(relay_lib + 1, SYNC_TIMEOUT).await,
        "node 1 finality stalled after bounce"
    );
    observe_finality(cluster.node(1)?, &mut relay_lib).await?;

    cluster.down(&[2]).await?;
    assert_eq!(cluster.state(), ClusterState::PartiallyDown);
    cluster.bounce(&[2]).await?;
    assert_eq!(cluster.state(), ClusterState::Running);
    cluster.validate_accounts(Some(&accounts)).await?;

    let follower = cluster.node(2)?;
    let head = cluster.node(0)?.get_head_block_num().await?;
    ensure!(follower.wait_for_head_block(head, SYNC_TIMEOUT).await, "node 2 lost sync after bounce");
    assert_balance(follower, &alice.name, "20.0000 SYS").await?;

    cluster.killall(false).await?;
    cluster.killall(false).await?;
    assert_eq!(cluster.state(), ClusterState::Terminated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_producer_stops_advancing_and_relaunches_from_its_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cluster = Cluster::new(support::stub_config(dir.path()))?;
    cluster
        .launch(ClusterTopology::new(1, 1).with_common_args(support::FAST_BLOCKS))
        .await?;

    let node = cluster.node(0)?;
    let irreversible = node.get_irreversible_block_num().await?;
    ensure!(
        node.wait_for_irreversible_block(irreversible + 2, SYNC_TIMEOUT).await,
        "last irreversible block did not advance"
    );

    node.pause_producer().await?;
    assert!(node.is_producer_paused().await?);
    let paused_at = node.get_head_block_num().await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(node.get_head_block_num().await?, paused_at);

    let chain_id = node.get_info().await?.chain_id;
    cluster.kill_node(0, Signal::Terminate).await?;
    assert_eq!(cluster.state(), ClusterState::PartiallyDown);
    assert!(cluster.relaunch(0, Duration::from_secs(20)).await);

    let node = cluster.node(0)?;
    let info = node.get_info().await?;
    assert_eq!(info.chain_id, chain_id);
    assert!(info.head_block_num >= paused_at);
    // a relaunched producer starts unpaused
    assert!(!node.is_producer_paused().await?);
    cluster.validate_accounts(None).await?;

    cluster.killall(false).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminated_cluster_relaunches_as_a_fresh_chain() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cluster = Cluster::new(support::stub_config(dir.path()))?;
    cluster
        .launch(ClusterTopology::new(1, 1).with_common_args(support::FAST_BLOCKS))
        .await?;
    cluster.killall(false).await?;
    assert_eq!(cluster.state(), ClusterState::Terminated);

    cluster
        .launch(ClusterTopology::new(1, 1).with_common_args(support::FAST_BLOCKS))
        .await?;
    assert_eq!(cluster.state(), ClusterState::Running);
    cluster.validate_accounts(None).await?;
    let eosio = cluster.eosio_account()?.clone();
    let wallet = cluster.wallets().wallet(IGNITION_WALLET).cloned();
    assert!(wallet.is_some_and(|wallet| wallet.unlocked && wallet.contains(&eosio.name)));

    cluster.killall(false).await?;
    Ok(())
}
