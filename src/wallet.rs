//! Client and lifecycle manager for the detached key-custody daemon.
//!
//! The daemon holds every private key the harness imports and signs
//! transactions on request; the harness itself never signs.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::process::{self, ManagedProcess, ProcessSpec, Signal};
use crate::rpc::RpcEndpoint;
use crate::transaction::{SignedTransaction, Transaction};

/// Unlock timeout handed to the daemon; long enough that wallets never relock mid-run.
const UNLOCK_TIMEOUT_SECS: u64 = 999_999;

/// Typed access to the daemon's positional-JSON RPC surface.
#[derive(Clone, Debug)]
pub struct WalletClient {
    endpoint: RpcEndpoint,
}

impl WalletClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> HarnessResult<Self> {
        Ok(Self {
            endpoint: RpcEndpoint::new(base_url, request_timeout)?,
        })
    }

    pub fn base_url(&self) -> String {
        self.endpoint.base_url().to_string()
    }

    /// Creates a wallet and returns its generated password.
    pub async fn create(&self, name: &str) -> HarnessResult<String> {
        self.endpoint.post("/v1/wallet/create", &name).await
    }

    pub async fn open(&self, name: &str) -> HarnessResult<()> {
        self.call("/v1/wallet/open", &name).await
    }

    pub async fn lock(&self, name: &str) -> HarnessResult<()> {
        self.call("/v1/wallet/lock", &name).await
    }

    pub async fn lock_all(&self) -> HarnessResult<()> {
        self.call("/v1/wallet/lock_all", &()).await
    }

    pub async fn unlock(&self, name: &str, password: &str) -> HarnessResult<()> {
        self.call("/v1/wallet/unlock", &[name, password]).await
    }

    pub async fn import_key(&self, name: &str, private_key: &str) -> HarnessResult<()> {
        self.call("/v1/wallet/import_key", &[name, private_key]).await
    }

    /// Wallet names as reported by the daemon; unlocked wallets carry a ` *` suffix.
    pub async fn list_wallets(&self) -> HarnessResult<Vec<String>> {
        self.endpoint.post("/v1/wallet/list_wallets", &()).await
    }

    /// Public keys of every unlocked wallet.
    pub async fn get_public_keys(&self) -> HarnessResult<Vec<String>> {
        self.endpoint.post("/v1/wallet/get_public_keys", &()).await
    }

    pub async fn sign_transaction(
        &self,
        transaction: &Transaction,
        public_keys: &[String],
        chain_id: &str,
    ) -> HarnessResult<SignedTransaction> {
        let unsigned = SignedTransaction {
            transaction: transaction.clone(),
            signatures: Vec::new(),
            context_free_data: Vec::new(),
        };
        let params = (unsigned, public_keys, chain_id);
        self.endpoint.post("/v1/wallet/sign_transaction", &params).await
    }

    async fn call<Req: Serialize + ?Sized>(&self, path: &str, body: &Req) -> HarnessResult<()> {
        let _: Value = self.endpoint.post(path, body).await?;
        Ok(())
    }
}

/// A wallet created through the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Wallet {
    pub name: String,
    pub password: String,
    pub unlocked: bool,
    pub imported_accounts: BTreeMap<String, Account>,
}

impl Wallet {
    pub fn contains(&self, account_name: &str) -> bool {
        self.imported_accounts.contains_key(account_name)
    }
}

/// Owns the wallet daemon process and the wallets created during a run.
#[derive(Debug)]
pub struct WalletManager {
    binary: PathBuf,
    data_dir: PathBuf,
    address: String,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    poll_interval: Duration,
    client: WalletClient,
    process: Option<ManagedProcess>,
    wallets: BTreeMap<String, Wallet>,
}

impl WalletManager {
    pub fn new(config: &HarnessConfig) -> HarnessResult<Self> {
        let host = config.network.host.clone();
        let port = match config.network.wallet_port {
            Some(port) => port,
            None => process::random_port(&host)?,
        };
        let address = format!("{host}:{port}");
        let client = WalletClient::new(&format!("http://{address}"), config.timeouts.request())?;
        Ok(Self {
            binary: config.binaries.wallet.clone(),
            data_dir: config.paths.wallet_dir(),
            address,
            startup_timeout: config.timeouts.startup(),
            shutdown_timeout: config.timeouts.shutdown(),
            poll_interval: config.timeouts.poll_interval(),
            client,
            process: None,
            wallets: BTreeMap::new(),
        })
    }

    pub fn client(&self) -> &WalletClient {
        &self.client
    }

    pub fn wallet(&self, name: &str) -> Option<&Wallet> {
        self.wallets.get(name)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ManagedProcess::pid)
    }

    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ManagedProcess::is_running)
    }

    /// Starts the daemon and waits until it answers RPC requests.
    pub async fn launch(&mut self) -> HarnessResult<()> {
        if self.is_running() {
            return Ok(());
        }
        fs::create_dir_all(&self.data_dir)?;
        let spec = ProcessSpec {
            label: "wallet".to_string(),
            program: self.binary.clone(),
            args: vec![
                "--data-dir".to_string(),
                self.data_dir.display().to_string(),
                "--http-server-address".to_string(),
                self.address.clone(),
                "--unlock-timeout".to_string(),
                UNLOCK_TIMEOUT_SECS.to_string(),
            ],
            stdout_path: self.data_dir.join("stdout.txt"),
            stderr_path: self.data_dir.join("stderr.txt"),
        };
        let mut child = ManagedProcess::spawn(&spec)?;
        let client = self.client.clone();
        process::wait_for_ready(
            &mut child,
            || {
                let client = client.clone();
                async move { client.list_wallets().await.is_ok() }
            },
            self.startup_timeout,
            self.poll_interval,
        )
        .await?;
        info!(target = "harness::wallet", pid = child.pid(), address = %self.address, "wallet daemon ready");
        self.process = Some(child);
        self.reopen_known().await;
        Ok(())
    }

    /// Reopens and unlocks wallets created before the daemon was restarted.
    /// Wallets whose files are gone are forgotten.
    async fn reopen_known(&mut self) {
        let names: Vec<String> = self.wallets.keys().cloned().collect();
        for name in names {
            if let Err(err) = self.unlock(&name).await {
                warn!(target = "harness::wallet", wallet = %name, error = %err, "forgetting wallet that cannot be reopened");
                self.wallets.remove(&name);
            }
        }
    }

    /// Stops the daemon; wallets on disk survive and can be reopened after `launch`.
    pub async fn kill(&mut self) -> HarnessResult<()> {
        if let Some(mut child) = self.process.take() {
            child.stop(Signal::Terminate, self.shutdown_timeout).await?;
            debug!(target = "harness::wallet", pid = child.pid(), "wallet daemon stopped");
        }
        for wallet in self.wallets.values_mut() {
            wallet.unlocked = false;
        }
        Ok(())
    }

    /// Stops the managed daemon and, when asked, every other process running the same binary.
    pub async fn killall(&mut self, include_unmanaged: bool) -> HarnessResult<()> {
        self.kill().await?;
        if include_unmanaged {
            if let Some(name) = self.binary.file_name().and_then(|name| name.to_str()) {
                process::kill_unmanaged(name, &[]);
            }
        }
        Ok(())
    }

    /// Creates `name` and imports the keys of `accounts`. An already known
    /// wallet is returned as is after importing any accounts it lacks.
    pub async fn create(&mut self, name: &str, accounts: &[Account]) -> HarnessResult<Wallet> {
        if !self.wallets.contains_key(name) {
            let password = self
                .client
                .create(name)
                .await
                .map_err(|err| HarnessError::Wallet(format!("failed to create wallet {name}: {err}")))?;
            debug!(target = "harness::wallet", wallet = name, %password, "wallet created");
            self.wallets.insert(
                name.to_string(),
                Wallet {
                    name: name.to_string(),
                    password,
                    unlocked: true,
                    imported_accounts: BTreeMap::new(),
                },
            );
        }
        for account in accounts {
            if !self.import_key(account, name).await? {
                warn!(
                    target = "harness::wallet",
                    wallet = name,
                    account = %account.name,
                    "account has no private keys to import"
                );
            }
        }
        self.known(name).cloned()
    }

    /// Imports owner and active keys of `account` into `wallet_name`.
    /// Returns `false` when the account carries no private key material.
    pub async fn import_key(&mut self, account: &Account, wallet_name: &str) -> HarnessResult<bool> {
        self.known(wallet_name)?;
        let keys = account.private_keys();
        if keys.is_empty() {
            return Ok(false);
        }
        for key in keys {
            if let Err(err) = self.client.import_key(wallet_name, key).await {
                // re-importing a key the wallet already holds is harmless
                if !err.to_string().contains("already") {
                    return Err(HarnessError::Wallet(format!(
                        "failed to import key of {} into {wallet_name}: {err}",
                        account.name
                    )));
                }
            }
        }
        if let Some(wallet) = self.wallets.get_mut(wallet_name) {
            wallet
                .imported_accounts
                .insert(account.name.clone(), account.clone());
        }
        Ok(true)
    }

    pub async fn open(&mut self, name: &str) -> HarnessResult<()> {
        self.client.open(name).await
    }

    pub async fn lock(&mut self, name: &str) -> HarnessResult<()> {
        self.client.lock(name).await?;
        if let Some(wallet) = self.wallets.get_mut(name) {
            wallet.unlocked = false;
        }
        Ok(())
    }

    pub async fn lock_all(&mut self) -> HarnessResult<()> {
        self.client.lock_all().await?;
        for wallet in self.wallets.values_mut() {
            wallet.unlocked = false;
        }
        Ok(())
    }

    /// Opens and unlocks a wallet created earlier in this run.
    pub async fn unlock(&mut self, name: &str) -> HarnessResult<()> {
        let password = self.known(name)?.password.clone();
        self.client.open(name).await?;
        if let Err(err) = self.client.unlock(name, &password).await {
            if !err.to_string().contains("already unlocked") {
                return Err(err);
            }
        }
        if let Some(wallet) = self.wallets.get_mut(name) {
            wallet.unlocked = true;
        }
        Ok(())
    }

    /// `(name, unlocked)` pairs as reported by the daemon.
    pub async fn list_wallets(&self) -> HarnessResult<Vec<(String, bool)>> {
        let listed = self.client.list_wallets().await?;
        Ok(listed
            .into_iter()
            .map(|entry| match entry.strip_suffix(" *") {
                Some(name) => (name.to_string(), true),
                None => (entry, false),
            })
            .collect())
    }

    pub async fn public_keys(&self) -> HarnessResult<Vec<String>> {
        self.client.get_public_keys().await
    }

    /// Removes every wallet file from disk. Only valid while the daemon is stopped.
    pub fn cleanup(&mut self) -> HarnessResult<()> {
        if self.process.is_some() {
            return Err(HarnessError::Wallet(
                "refusing to remove wallet files while the daemon is running".to_string(),
            ));
        }
        if self.data_dir.exists() {
            fs::remove_dir_all(&self.data_dir)?;
        }
        self.wallets.clear();
        Ok(())
    }

    fn known(&self, name: &str) -> HarnessResult<&Wallet> {
        self.wallets.get(name).ok_or_else(|| HarnessError::NotFound {
            entity: "wallet",
            id: name.to_string(),
        })
    }
}
