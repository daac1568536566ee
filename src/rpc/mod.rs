//! HTTP plumbing shared by the node and wallet clients.

pub mod types;

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::errors::{HarnessError, HarnessResult, RpcError, RpcErrorKind};
use types::{schema, ErrorEnvelope};

/// JSON-over-HTTP endpoint with a bounded per-request timeout.
///
/// The timeout is deliberately separate from the cluster-level wait timeouts:
/// a call to a killed process must fail with a transport error quickly so the
/// caller's polling loop can decide what to do next.
#[derive(Clone, Debug)]
pub struct RpcEndpoint {
    client: Client,
    base_url: Url,
}

impl RpcEndpoint {
    pub fn new(base_url: &str, request_timeout: Duration) -> HarnessResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|err| HarnessError::Config(format!("failed to build HTTP client: {err}")))?;
        let mut base_url = Url::parse(base_url)
            .map_err(|err| HarnessError::Config(format!("invalid endpoint {base_url:?}: {err}")))?;
        if base_url.path() != "/" {
            base_url.set_path("/");
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// POSTs `body` and decodes the response, treating 404 as an error.
    pub async fn post<Req, Resp>(&self, path: &str, body: &Req) -> HarnessResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        match self.post_optional(path, body).await? {
            Some(response) => Ok(response),
            None => Err(HarnessError::NotFound {
                entity: "endpoint",
                id: path.to_string(),
            }),
        }
    }

    /// POSTs `body`; a 404 response yields `Ok(None)`.
    pub async fn post_optional<Req, Resp>(&self, path: &str, body: &Req) -> HarnessResult<Option<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| HarnessError::Config(format!("invalid RPC path {path:?}: {err}")))?;
        debug!(target = "harness::rpc", %url, "rpc request");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| RpcError::transport(path, err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RpcError::transport(path, err.to_string()))?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_failure(path, status.as_u16(), &bytes).into());
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| schema(path, err.to_string()))
    }
}

pub(crate) fn classify_failure(path: &str, status: u16, body: &[u8]) -> RpcError {
    let envelope: Option<ErrorEnvelope> = serde_json::from_slice(body).ok();
    let (name, message) = match &envelope {
        Some(envelope) => (envelope.error.name.clone(), envelope.describe()),
        None => (String::new(), String::from_utf8_lossy(body).trim().to_string()),
    };
    let kind = if message.contains("overdrawn balance") || name == "insufficient_balance" {
        RpcErrorKind::InsufficientBalance
    } else if name == "tx_duplicate" || message.contains("duplicate transaction") {
        RpcErrorKind::DuplicateTransaction
    } else {
        RpcErrorKind::Rejected
    };
    RpcError::rejected(path, Some(status), kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overdrawn_balance_is_classified() {
        let body = serde_json::to_vec(&ErrorEnvelope::new(
            500,
            3_050_003,
            "eosio_assert_message_exception",
            "assertion failure with message: overdrawn balance",
        ))
        .expect("encode");
        let err = classify_failure("/v1/chain/push_transaction", 500, &body);
        assert_eq!(err.kind, RpcErrorKind::InsufficientBalance);
        assert_eq!(err.status, Some(500));
    }

    #[test]
    fn duplicate_and_plain_bodies_are_classified() {
        let body = serde_json::to_vec(&ErrorEnvelope::new(
            500,
            3_040_008,
            "tx_duplicate",
            "duplicate transaction abc",
        ))
        .expect("encode");
        assert_eq!(
            classify_failure("/push", 500, &body).kind,
            RpcErrorKind::DuplicateTransaction
        );

        let plain = classify_failure("/push", 400, b"bad request\n");
        assert_eq!(plain.kind, RpcErrorKind::Rejected);
        assert_eq!(plain.message, "bad request");
    }

    #[test]
    fn endpoint_normalises_base_path() {
        let endpoint =
            RpcEndpoint::new("http://127.0.0.1:8888/v1/chain", Duration::from_secs(1)).expect("endpoint");
        assert_eq!(endpoint.base_url().as_str(), "http://127.0.0.1:8888/");
    }
}
