use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use ledger_harness::asset::Symbol;
use ledger_harness::errors::{HarnessError, RpcErrorKind};
use ledger_harness::node::{NodeClient, NodeClientSettings};
use ledger_harness::rpc::types::ErrorEnvelope;
use ledger_harness::wallet::WalletClient;
use ledger_harness::Cluster;

const TRACE_ID: &str = "5a1f0c3e0b7d4a2f9c8e6d5b4a3f2e1d0c9b8a7f6e5d4c3b2a1f0e9d8c7b6a5f";
/// Id the mock assigns to every accepted push; no trace is ever served for it.
const PUSHED_ID: &str = "0f0e0d0c0b0a09080706050403020100f0e0d0c0b0a090807060504030201000";

#[derive(Clone, Default)]
struct MockNode {
    trace_lookups: Arc<AtomicU32>,
    pushes: Arc<AtomicU32>,
}

fn block_id(num: u32) -> String {
    format!("{num:08x}{}", "ab".repeat(28))
}

fn info(head: u32, lib: u32) -> Value {
    json!({
        "server_version": "mock",
        "chain_id": "cf057bbfb72640471fd910bcb67639c22df9f92470936cddc1ade0e2f2e7dc4f",
        "head_block_num": head,
        "head_block_id": block_id(head),
        "head_block_time": "2024-01-01T00:00:00.000Z",
        "head_block_producer": "eosio",
        "last_irreversible_block_num": lib,
        "last_irreversible_block_id": block_id(lib),
    })
}

fn not_found(name: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorEnvelope::new(404, 3_040_011, name, "not found"))).into_response()
}

async fn get_info() -> Json<Value> {
    Json(info(12, 10))
}

async fn get_account(Json(request): Json<Value>) -> Response {
    if request["account_name"] == "missing11111" {
        return not_found("account_query_exception");
    }
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorEnvelope::new(500, 0, "fc_exception", "boom"))).into_response()
}

async fn get_currency_balance(Json(request): Json<Value>) -> Json<Vec<String>> {
    match request["account"].as_str() {
        Some("funded111111") => Json(vec!["97.5321 SYS".to_string()]),
        Some("garbled11111") => Json(vec!["plenty of SYS".to_string()]),
        _ => Json(Vec::new()),
    }
}

async fn get_transaction_trace(State(mock): State<MockNode>, Json(request): Json<Value>) -> Response {
    if request["id"] != TRACE_ID {
        return not_found("tx_not_found");
    }
    // the transaction only becomes visible on the third lookup
    if mock.trace_lookups.fetch_add(1, Ordering::SeqCst) < 2 {
        return not_found("tx_not_found");
    }
    Json(json!({
        "id": TRACE_ID,
        "block_num": 11,
        "status": "executed",
        "actions": [{
            "receiver": "eosio.token",
            "account": "eosio.token",
            "action": "transfer",
            "authorization": [{"actor": "testera11111", "permission": "active"}],
            "params": {"from": "testera11111", "to": "currency1111", "quantity": "97.5311 SYS", "memo": ""},
        }],
    }))
    .into_response()
}

async fn get_required_keys() -> Json<Value> {
    Json(json!({"required_keys": []}))
}

async fn push_transaction(State(mock): State<MockNode>, Json(request): Json<Value>) -> Response {
    mock.pushes.fetch_add(1, Ordering::SeqCst);
    if request["actions"][0]["data"]["memo"] == "reject" {
        let envelope = ErrorEnvelope::new(
            500,
            3_050_003,
            "eosio_assert_message_exception",
            "assertion failure with message: rejected",
        );
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response();
    }
    Json(json!({
        "transaction_id": PUSHED_ID,
        "processed": {"id": PUSHED_ID, "block_num": 13},
    }))
    .into_response()
}

async fn wallet_public_keys() -> Json<Vec<String>> {
    Json(Vec::new())
}

/// Hands the unsigned transaction back as if it had been signed.
async fn wallet_sign(Json(params): Json<Value>) -> Json<Value> {
    Json(params[0].clone())
}

async fn spawn_mock(mock: MockNode) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/v1/chain/get_info", post(get_info))
        .route("/v1/chain/get_required_keys", post(get_required_keys))
        .route("/v1/chain/push_transaction", post(push_transaction))
        .route("/v1/wallet/get_public_keys", post(wallet_public_keys))
        .route("/v1/wallet/sign_transaction", post(wallet_sign))
        .route("/v1/chain/get_account", post(get_account))
        .route("/v1/chain/get_currency_balance", post(get_currency_balance))
        .route("/v1/trace_api/get_transaction_trace", post(get_transaction_trace))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

fn client(addr: SocketAddr) -> Result<NodeClient> {
    let settings = NodeClientSettings {
        request_timeout: Duration::from_secs(2),
        block_inclusion: Duration::from_secs(2),
        irreversible: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        delayed_retry: Duration::from_secs(2),
        expiration: Duration::from_secs(30),
    };
    Ok(NodeClient::new(0, &format!("http://{addr}"), Symbol::new("SYS", 4)?, settings)?)
}

#[tokio::test]
async fn queries_map_node_responses_onto_typed_results() -> Result<()> {
    let addr = spawn_mock(MockNode::default()).await?;
    let node = client(addr)?;

    assert_eq!(node.get_head_block_num().await?, 12);
    assert_eq!(node.get_irreversible_block_num().await?, 10);
    assert!(node.wait_for_irreversible_block(10, Duration::from_millis(200)).await);
    assert!(!node.wait_for_irreversible_block(11, Duration::from_millis(100)).await);

    assert!(node.get_account("missing11111").await?.is_none());
    let err = node.get_account("broken111111").await.expect_err("server error");
    match err {
        HarnessError::Rpc(rpc) => assert_eq!(rpc.status, Some(500)),
        other => panic!("unexpected error {other}"),
    }

    assert_eq!(node.get_account_balance("funded111111").await?, "97.5321 SYS");
    // no balance row means the account never held the token
    assert_eq!(node.get_account_balance("empty1111111").await?, "0.0000 SYS");
    match node.get_account_balance("garbled11111").await.expect_err("malformed balance") {
        HarnessError::Schema { endpoint, .. } => assert_eq!(endpoint, "/v1/chain/get_currency_balance"),
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn delayed_retry_rides_out_missing_traces() -> Result<()> {
    let mock = MockNode::default();
    let addr = spawn_mock(mock.clone()).await?;
    let node = client(addr)?;

    let err = node.get_transaction(TRACE_ID, false).await.expect_err("not visible yet");
    assert!(matches!(err, HarnessError::NotFound { entity: "transaction", .. }), "{err}");

    let record = node.get_transaction(TRACE_ID, true).await?;
    assert_eq!(record.block_num, 11);
    ledger_harness::assertions::assert_transfer_action(&record, "transfer", 975_311)?;
    assert!(mock.trace_lookups.load(Ordering::SeqCst) >= 3);
    Ok(())
}

#[tokio::test]
async fn unreachable_node_fails_fast_as_transport_error() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let node = client(addr)?;
    assert!(!node.is_responsive().await);
    match node.get_info().await.expect_err("nothing listens") {
        HarnessError::Rpc(rpc) => assert_eq!(rpc.kind, RpcErrorKind::Transport),
        other => panic!("unexpected error {other}"),
    }

    // delayed retry rides out absence only, not a dead node
    let started = Instant::now();
    match node.get_transaction(TRACE_ID, true).await.expect_err("nothing listens") {
        HarnessError::Rpc(rpc) => assert_eq!(rpc.kind, RpcErrorKind::Transport),
        other => panic!("unexpected error {other}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    Ok(())
}

#[tokio::test]
async fn duplicate_guard_releases_only_transfers_the_node_refused() -> Result<()> {
    let mock = MockNode::default();
    let addr = spawn_mock(mock.clone()).await?;
    let signer = WalletClient::new(&format!("http://{addr}"), Duration::from_secs(2))?;
    let node = client(addr)?.with_signer(signer);
    let accounts = Cluster::create_account_keys(2)?;
    let (from, to) = (&accounts[0], &accounts[1]);

    // a refused push may be submitted again
    for attempt in 1..=2 {
        match node.transfer_funds(from, to, "1.0000 SYS", "reject", false, false).await {
            Err(HarnessError::Rpc(rpc)) => assert_eq!(rpc.status, Some(500)),
            other => panic!("attempt {attempt}: unexpected outcome {other:?}"),
        }
    }
    assert_eq!(mock.pushes.load(Ordering::SeqCst), 2);

    // an accepted push that never shows up in a block stays guarded
    let err = node
        .transfer_funds(from, to, "1.0000 SYS", "accepted", false, true)
        .await
        .expect_err("no block ever includes it");
    assert!(matches!(err, HarnessError::Timeout { .. }), "{err}");
    match node.transfer_funds(from, to, "1.0000 SYS", "accepted", false, true).await {
        Err(HarnessError::Rpc(rpc)) => assert_eq!(rpc.kind, RpcErrorKind::LocalDuplicate),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(mock.pushes.load(Ordering::SeqCst), 3);
    Ok(())
}
