use anyhow::Result;

#[path = "support/mod.rs"]
mod support;

use ledger_harness::wallet::WalletManager;
use ledger_harness::Cluster;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wallet_keys_survive_lock_cycles_and_restarts() -> Result<()> {
    support::init_tracing();
    let dir = tempfile::tempdir()?;
    let config = support::stub_config(dir.path());
    let mut wallets = WalletManager::new(&config)?;
    wallets.launch().await?;

    let accounts = Cluster::create_account_keys(2)?;
    let wallet = wallets.create("test", &accounts[..1]).await?;
    assert!(wallet.unlocked);
    assert!(wallet.contains(&accounts[0].name));
    assert!(!wallet.password.is_empty());

    // importing the same key twice is not an error
    assert!(wallets.import_key(&accounts[0], "test").await?);
    assert!(wallets.import_key(&accounts[1], "test").await?);
    let keys = wallets.public_keys().await?;
    for account in &accounts {
        assert!(keys.contains(&account.owner.public_key), "{keys:?}");
        assert!(keys.contains(&account.active.public_key), "{keys:?}");
    }

    wallets.lock("test").await?;
    assert_eq!(wallets.list_wallets().await?, vec![("test".to_string(), false)]);
    assert!(wallets.public_keys().await.is_err());

    wallets.unlock("test").await?;
    wallets.unlock("test").await?;
    assert_eq!(wallets.list_wallets().await?, vec![("test".to_string(), true)]);

    wallets.kill().await?;
    assert!(!wallets.is_running());
    wallets.launch().await?;
    wallets.unlock("test").await?;
    assert!(wallets.public_keys().await?.contains(&accounts[1].active.public_key));

    wallets.killall(false).await?;
    wallets.killall(false).await?;
    assert!(!wallets.is_running());
    wallets.cleanup()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_wallet_cannot_be_unlocked() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = support::stub_config(dir.path());
    let mut wallets = WalletManager::new(&config)?;
    wallets.launch().await?;

    assert!(wallets.unlock("missing").await.is_err());
    assert!(wallets.open("missing").await.is_err());
    assert!(wallets.list_wallets().await?.is_empty());

    wallets.killall(false).await?;
    Ok(())
}
