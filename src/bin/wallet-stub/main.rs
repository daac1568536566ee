//! Minimal key-custody daemon speaking the positional-JSON wallet API.
//!
//! Every wallet lives in `<data-dir>/<name>.wallet.json`. Keys are kept in
//! plain hex next to a salted password digest; this daemon backs local test
//! clusters only.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use ledger_harness::keys::{public_key_of, sign_digest};
use ledger_harness::rpc::types::ErrorEnvelope;
use ledger_harness::transaction::SignedTransaction;

const WALLET_SUFFIX: &str = ".wallet.json";

#[derive(Parser, Debug)]
#[command(name = "wallet-stub", version, about = "Local key-custody daemon for test clusters")]
struct Args {
    /// Directory holding one file per wallet
    #[arg(long = "data-dir", default_value = "./wallet")]
    data_dir: PathBuf,

    /// Listen address for the HTTP endpoint
    #[arg(long = "http-server-address", default_value = "127.0.0.1:8900")]
    listen: SocketAddr,

    /// Seconds an unlocked wallet stays unlocked
    #[arg(long = "unlock-timeout", default_value_t = 900)]
    unlock_timeout: u64,
}

#[derive(Debug, Error)]
enum WalletError {
    #[error("Wallet with name: '{0}' already exists")]
    Exists(String),
    #[error("Unable to open file: {0}")]
    NonExistent(String),
    #[error("Wallet not found: {0}")]
    NotOpen(String),
    #[error("Wallet is locked: {0}")]
    Locked(String),
    #[error("Wallet is already unlocked: {0}")]
    AlreadyUnlocked(String),
    #[error("Invalid wallet password for wallet: {0}")]
    InvalidPassword(String),
    #[error("Key already in wallet")]
    KeyExists,
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("You don't have any unlocked wallet!")]
    NoUnlocked,
    #[error("Public key not found in unlocked wallets {0}")]
    MissingKey(String),
    #[error("Name of wallet is invalid: {0:?}")]
    InvalidName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WalletError {
    fn name(&self) -> &'static str {
        match self {
            Self::Exists(_) => "wallet_exist_exception",
            Self::NonExistent(_) => "wallet_nonexistent_exception",
            Self::NotOpen(_) => "wallet_not_available_exception",
            Self::Locked(_) => "wallet_locked_exception",
            Self::AlreadyUnlocked(_) => "wallet_unlocked_exception",
            Self::InvalidPassword(_) => "wallet_invalid_password_exception",
            Self::KeyExists => "key_exist_exception",
            Self::InvalidKey(_) => "private_key_type_exception",
            Self::NoUnlocked => "wallet_missing_pub_key_exception",
            Self::MissingKey(_) => "wallet_missing_pub_key_exception",
            Self::InvalidName(_) => "wallet_exception",
            Self::Io(_) | Self::Serialization(_) => "fc_exception",
        }
    }
}

impl IntoResponse for WalletError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope::new(500, 3_120_000, self.name(), self.to_string());
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

type WalletResult<T> = Result<T, WalletError>;

/// On-disk form of a wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WalletFile {
    salt: String,
    password_digest: String,
    /// Public key to private key.
    keys: BTreeMap<String, String>,
}

impl WalletFile {
    fn new(password: &str) -> Self {
        let salt = random_hex(16);
        Self {
            password_digest: digest(&salt, password),
            salt,
            keys: BTreeMap::new(),
        }
    }

    fn accepts(&self, password: &str) -> bool {
        digest(&self.salt, password) == self.password_digest
    }
}

#[derive(Debug)]
struct OpenWallet {
    file: WalletFile,
    unlocked_at: Option<Instant>,
}

#[derive(Debug)]
struct Daemon {
    root: PathBuf,
    unlock_timeout: Duration,
    open: BTreeMap<String, OpenWallet>,
}

impl Daemon {
    fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}{WALLET_SUFFIX}"))
    }

    /// Relocks wallets whose unlock window has elapsed.
    fn expire(&mut self) {
        let timeout = self.unlock_timeout;
        for (name, wallet) in self.open.iter_mut() {
            if wallet.unlocked_at.is_some_and(|at| at.elapsed() > timeout) {
                debug!(wallet = %name, "unlock timeout elapsed");
                wallet.unlocked_at = None;
            }
        }
    }

    fn unlocked(&self) -> impl Iterator<Item = (&String, &OpenWallet)> {
        self.open.iter().filter(|(_, wallet)| wallet.unlocked_at.is_some())
    }

    fn unlocked_wallet(&mut self, name: &str) -> WalletResult<&mut OpenWallet> {
        let wallet = self
            .open
            .get_mut(name)
            .ok_or_else(|| WalletError::NotOpen(name.to_string()))?;
        if wallet.unlocked_at.is_none() {
            return Err(WalletError::Locked(name.to_string()));
        }
        Ok(wallet)
    }
}

type SharedDaemon = Arc<RwLock<Daemon>>;

#[tokio::main]
async fn main() -> Result<(), WalletError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    fs::create_dir_all(&args.data_dir).await?;
    let daemon = Arc::new(RwLock::new(Daemon {
        root: args.data_dir.clone(),
        unlock_timeout: Duration::from_secs(args.unlock_timeout),
        open: BTreeMap::new(),
    }));

    let app = Router::new()
        .route("/v1/wallet/create", post(create))
        .route("/v1/wallet/open", post(open))
        .route("/v1/wallet/lock", post(lock))
        .route("/v1/wallet/lock_all", post(lock_all))
        .route("/v1/wallet/unlock", post(unlock))
        .route("/v1/wallet/import_key", post(import_key))
        .route("/v1/wallet/list_wallets", post(list_wallets))
        .route("/v1/wallet/get_public_keys", post(get_public_keys))
        .route("/v1/wallet/sign_transaction", post(sign_transaction))
        .with_state(daemon);

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, data_dir = %args.data_dir.display(), "wallet daemon listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("wallet daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn create(State(daemon): State<SharedDaemon>, Json(name): Json<String>) -> WalletResult<Json<String>> {
    validate_name(&name)?;
    let mut daemon = daemon.write().await;
    let path = daemon.path(&name);
    if fs::try_exists(&path).await? {
        return Err(WalletError::Exists(name));
    }
    let password = format!("PW{}", random_hex(32));
    let file = WalletFile::new(&password);
    write_wallet(&path, &file).await?;
    daemon.open.insert(
        name.clone(),
        OpenWallet {
            file,
            unlocked_at: Some(Instant::now()),
        },
    );
    info!(wallet = %name, "wallet created");
    Ok(Json(password))
}

async fn open(State(daemon): State<SharedDaemon>, Json(name): Json<String>) -> WalletResult<Json<serde_json::Value>> {
    let mut daemon = daemon.write().await;
    if !daemon.open.contains_key(&name) {
        let path = daemon.path(&name);
        let file = read_wallet(&path)
            .await?
            .ok_or_else(|| WalletError::NonExistent(path.display().to_string()))?;
        daemon.open.insert(
            name.clone(),
            OpenWallet {
                file,
                unlocked_at: None,
            },
        );
        debug!(wallet = %name, "wallet opened");
    }
    Ok(Json(serde_json::json!({})))
}

async fn lock(State(daemon): State<SharedDaemon>, Json(name): Json<String>) -> WalletResult<Json<serde_json::Value>> {
    let mut daemon = daemon.write().await;
    let wallet = daemon
        .open
        .get_mut(&name)
        .ok_or_else(|| WalletError::NotOpen(name.clone()))?;
    wallet.unlocked_at = None;
    Ok(Json(serde_json::json!({})))
}

async fn lock_all(State(daemon): State<SharedDaemon>) -> Json<serde_json::Value> {
    let mut daemon = daemon.write().await;
    for wallet in daemon.open.values_mut() {
        wallet.unlocked_at = None;
    }
    Json(serde_json::json!({}))
}

async fn unlock(
    State(daemon): State<SharedDaemon>,
    Json((name, password)): Json<(String, String)>,
) -> WalletResult<Json<serde_json::Value>> {
    let mut daemon = daemon.write().await;
    daemon.expire();
    let wallet = daemon
        .open
        .get_mut(&name)
        .ok_or_else(|| WalletError::NotOpen(name.clone()))?;
    if wallet.unlocked_at.is_some() {
        return Err(WalletError::AlreadyUnlocked(name));
    }
    if !wallet.file.accepts(&password) {
        return Err(WalletError::InvalidPassword(name));
    }
    wallet.unlocked_at = Some(Instant::now());
    Ok(Json(serde_json::json!({})))
}

async fn import_key(
    State(daemon): State<SharedDaemon>,
    Json((name, private_key)): Json<(String, String)>,
) -> WalletResult<Json<serde_json::Value>> {
    let public_key =
        public_key_of(&private_key).map_err(|err| WalletError::InvalidKey(err.to_string()))?;
    let mut daemon = daemon.write().await;
    daemon.expire();
    let path = daemon.path(&name);
    let wallet = daemon.unlocked_wallet(&name)?;
    if wallet.file.keys.contains_key(&public_key) {
        return Err(WalletError::KeyExists);
    }
    wallet.file.keys.insert(public_key.clone(), private_key);
    write_wallet(&path, &wallet.file).await?;
    debug!(wallet = %name, key = %public_key, "key imported");
    Ok(Json(serde_json::json!({})))
}

async fn list_wallets(State(daemon): State<SharedDaemon>) -> Json<Vec<String>> {
    let mut daemon = daemon.write().await;
    daemon.expire();
    let names = daemon
        .open
        .iter()
        .map(|(name, wallet)| {
            if wallet.unlocked_at.is_some() {
                format!("{name} *")
            } else {
                name.clone()
            }
        })
        .collect();
    Json(names)
}

async fn get_public_keys(State(daemon): State<SharedDaemon>) -> WalletResult<Json<Vec<String>>> {
    let mut daemon = daemon.write().await;
    daemon.expire();
    let mut keys: Vec<String> = daemon
        .unlocked()
        .flat_map(|(_, wallet)| wallet.file.keys.keys().cloned())
        .collect();
    if daemon.unlocked().next().is_none() {
        return Err(WalletError::NoUnlocked);
    }
    keys.sort();
    keys.dedup();
    Ok(Json(keys))
}

async fn sign_transaction(
    State(daemon): State<SharedDaemon>,
    Json((mut transaction, public_keys, chain_id)): Json<(SignedTransaction, Vec<String>, String)>,
) -> WalletResult<Json<SignedTransaction>> {
    let mut daemon = daemon.write().await;
    daemon.expire();
    let digest = transaction.transaction.signing_digest(&chain_id);
    for public_key in &public_keys {
        let private_key = daemon
            .unlocked()
            .find_map(|(_, wallet)| wallet.file.keys.get(public_key))
            .ok_or_else(|| WalletError::MissingKey(public_key.clone()))?;
        let signature =
            sign_digest(private_key, &digest).map_err(|err| WalletError::InvalidKey(err.to_string()))?;
        transaction.signatures.push(signature);
    }
    debug!(id = %transaction.id(), signatures = transaction.signatures.len(), "transaction signed");
    Ok(Json(transaction))
}

fn validate_name(name: &str) -> WalletResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(WalletError::InvalidName(name.to_string()))
    }
}

async fn read_wallet(path: &Path) -> WalletResult<Option<WalletFile>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn write_wallet(path: &Path, file: &WalletFile) -> WalletResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(file)?).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
