use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Classification of a failed node or wallet RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// The endpoint could not be reached or did not answer in time.
    Transport,
    /// A token transfer or stake would overdraw the payer.
    InsufficientBalance,
    /// The node already saw an identical transaction.
    DuplicateTransaction,
    /// The request was refused by the local double-submission guard.
    LocalDuplicate,
    /// Any other rejection reported by the remote service.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub endpoint: String,
    pub status: Option<u16>,
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            status: None,
            kind: RpcErrorKind::Transport,
            message: message.into(),
        }
    }

    pub fn rejected(
        endpoint: impl Into<String>,
        status: Option<u16>,
        kind: RpcErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind == RpcErrorKind::Transport
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} returned {} ({:?}): {}",
                self.endpoint, status, self.kind, self.message
            ),
            None => write!(f, "{} failed ({:?}): {}", self.endpoint, self.kind, self.message),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("cluster launch failed: {0}")]
    Launch(String),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("process {process}: {message}")]
    Process { process: String, message: String },
    #[error("validation failed for {what}: expected {expected}, actual {actual}")]
    Validation {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error("key generation failed: {0}")]
    KeyGen(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed response from {endpoint}: {message}")]
    Schema { endpoint: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    pub fn validation(
        what: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::Validation {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn process(process: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Process {
            process: process.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn rpc_kind(&self) -> Option<&RpcErrorKind> {
        match self {
            Self::Rpc(err) => Some(&err.kind),
            _ => None,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_reports_both_values() {
        let err = HarnessError::validation("balance of testera11111", "97.5321 SYS", "0.0000 SYS");
        let rendered = err.to_string();
        assert!(rendered.contains("expected 97.5321 SYS"));
        assert!(rendered.contains("actual 0.0000 SYS"));
    }

    #[test]
    fn rpc_kind_is_exposed_through_harness_error() {
        let err: HarnessError = RpcError::rejected(
            "/v1/chain/push_transaction",
            Some(500),
            RpcErrorKind::InsufficientBalance,
            "overdrawn balance",
        )
        .into();
        assert_eq!(err.rpc_kind(), Some(&RpcErrorKind::InsufficientBalance));
        assert!(!err.is_not_found());
    }
}
