use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;

use ledger_harness::rpc::types::{
    AccountResponse, BlocksRequest, ChainInfo, CurrencyBalanceRequest, ErrorEnvelope, GetAccountRequest,
    ProtocolFeatureActivationRequest, PushTransactionResponse, RequiredKeysRequest, RequiredKeysResponse,
    ResultResponse, SnapshotResponse, TransactionTrace, TransactionTraceRequest,
};
use ledger_harness::transaction::SignedTransaction;

use crate::chain::{Block, ChainError};
use crate::runtime::{NodeError, NodeRuntime, RelayRequest, MAX_RELAY_HOPS};

pub const SERVER_VERSION: &str = "ledger-node-stub";

type AppState = Arc<NodeRuntime>;

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        match self {
            NodeError::Chain(err) => {
                let status = if err.is_not_found() {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                chain_error_response(status, &err)
            }
            NodeError::Remote { status, envelope } => envelope_response(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                envelope,
            ),
        }
    }
}

/// A refused transaction is always a rejection, even when it names an
/// account or transaction the chain does not know.
struct PushError(NodeError);

impl From<NodeError> for PushError {
    fn from(err: NodeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        match self.0 {
            NodeError::Chain(err) => chain_error_response(StatusCode::INTERNAL_SERVER_ERROR, &err),
            remote => remote.into_response(),
        }
    }
}

fn chain_error_response(status: StatusCode, err: &ChainError) -> Response {
    let (code, name) = err.code_and_name();
    envelope_response(status, ErrorEnvelope::new(status.as_u16(), code, name, err.to_string()))
}

fn envelope_response(status: StatusCode, envelope: ErrorEnvelope) -> Response {
    debug!(status = status.as_u16(), error = %envelope.describe(), "request failed");
    (status, Json(envelope)).into_response()
}

pub fn router(runtime: AppState) -> Router {
    Router::new()
        .route("/v1/chain/get_info", post(get_info))
        .route("/v1/chain/get_account", post(get_account))
        .route("/v1/chain/get_currency_balance", post(get_currency_balance))
        .route("/v1/chain/get_required_keys", post(get_required_keys))
        .route("/v1/chain/push_transaction", post(push_transaction))
        .route("/v1/trace_api/get_transaction_trace", post(get_transaction_trace))
        .route("/v1/producer/create_snapshot", post(create_snapshot))
        .route("/v1/producer/pause", post(pause))
        .route("/v1/producer/resume", post(resume))
        .route("/v1/producer/paused", post(paused))
        .route(
            "/v1/producer/schedule_protocol_feature_activations",
            post(schedule_protocol_feature_activations),
        )
        .route("/v1/net/blocks", post(blocks))
        .route("/v1/net/push_transaction", post(relay_transaction))
        .fallback(not_found)
        .with_state(runtime)
}

async fn get_info(State(runtime): State<AppState>) -> Json<ChainInfo> {
    Json(runtime.with_chain(|chain| chain.info(SERVER_VERSION)))
}

async fn get_account(
    State(runtime): State<AppState>,
    Json(request): Json<GetAccountRequest>,
) -> Result<Json<AccountResponse>, NodeError> {
    let account = runtime.with_chain(|chain| chain.account(&request.account_name))?;
    Ok(Json(account))
}

async fn get_currency_balance(
    State(runtime): State<AppState>,
    Json(request): Json<CurrencyBalanceRequest>,
) -> Json<Vec<String>> {
    Json(runtime.with_chain(|chain| {
        chain.currency_balance(&request.code, &request.account, request.symbol.as_deref())
    }))
}

async fn get_required_keys(
    State(runtime): State<AppState>,
    Json(request): Json<RequiredKeysRequest>,
) -> Result<Json<RequiredKeysResponse>, NodeError> {
    let required_keys =
        runtime.with_chain(|chain| chain.required_keys(&request.transaction, &request.available_keys))?;
    Ok(Json(RequiredKeysResponse { required_keys }))
}

async fn push_transaction(
    State(runtime): State<AppState>,
    Json(transaction): Json<SignedTransaction>,
) -> Result<Json<PushTransactionResponse>, PushError> {
    let response = runtime.push_transaction(transaction, MAX_RELAY_HOPS).await?;
    Ok(Json(response))
}

async fn relay_transaction(
    State(runtime): State<AppState>,
    Json(request): Json<RelayRequest>,
) -> Result<Json<PushTransactionResponse>, PushError> {
    let response = runtime.push_transaction(request.transaction, request.hops).await?;
    Ok(Json(response))
}

async fn get_transaction_trace(
    State(runtime): State<AppState>,
    Json(request): Json<TransactionTraceRequest>,
) -> Result<Json<TransactionTrace>, NodeError> {
    let trace = runtime.with_chain(|chain| chain.trace(&request.id))?;
    Ok(Json(trace))
}

async fn create_snapshot(State(runtime): State<AppState>) -> Result<Json<SnapshotResponse>, NodeError> {
    let snapshot = runtime.with_chain(|chain| chain.write_snapshot())?;
    Ok(Json(snapshot))
}

async fn pause(State(runtime): State<AppState>) -> Json<ResultResponse> {
    runtime.pause();
    Json(ResultResponse::ok())
}

async fn resume(State(runtime): State<AppState>) -> Json<ResultResponse> {
    runtime.resume();
    Json(ResultResponse::ok())
}

async fn paused(State(runtime): State<AppState>) -> Json<bool> {
    Json(runtime.is_paused())
}

async fn schedule_protocol_feature_activations(
    State(runtime): State<AppState>,
    Json(request): Json<ProtocolFeatureActivationRequest>,
) -> Json<ResultResponse> {
    runtime.schedule_features(request.protocol_features_to_activate);
    Json(ResultResponse::ok())
}

async fn blocks(State(runtime): State<AppState>, Json(request): Json<BlocksRequest>) -> Json<Vec<Block>> {
    Json(runtime.blocks_since(request.since))
}

async fn not_found() -> (StatusCode, Json<ErrorEnvelope>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorEnvelope::new(404, 0, "unknown_endpoint_exception", "unknown endpoint")),
    )
}
