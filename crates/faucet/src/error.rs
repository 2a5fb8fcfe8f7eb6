//! Error types for the faucet service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Claim store failures. Never shown to callers verbatim.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Managed KV request failed: {0}")]
    RestKv(String),

    #[error("Corrupt claim record for {identity}: {reason}")]
    Corrupt { identity: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store contention: gave up after {0} attempts")]
    Contention(usize),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ledger-side failures reported by a distributor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributorError {
    /// The ledger refused the transfer. Nothing was spent.
    #[error("Transfer rejected: {0}")]
    Rejected(String),

    /// The ledger could not be reached before anything was sent.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// The transfer may or may not have landed.
    #[error("Ambiguous transfer outcome (tx: {}): {reason}", .tx_hash.as_deref().unwrap_or("unknown"))]
    Ambiguous {
        tx_hash: Option<String>,
        reason: String,
    },
}

impl DistributorError {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, DistributorError::Ambiguous { .. })
    }
}

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Invalid address")]
    InvalidAddress,

    #[error("Already claimed: try again in {:.2} hours", hours(.0))]
    Throttled(Duration),

    #[error("Insufficient funds in faucet")]
    InsufficientFunds,

    #[error("Transfer failed: {0}")]
    TransferFailed(DistributorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Distributor error: {0}")]
    Distributor(DistributorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type FaucetResult<T> = Result<T, FaucetError>;

pub(crate) fn hours(duration: &Duration) -> f64 {
    duration.as_secs_f64() / 3600.0
}

impl FaucetError {
    /// Stable code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            FaucetError::InvalidAddress => "INVALID_ADDRESS",
            FaucetError::Throttled(_) => "RATE_LIMITED",
            FaucetError::InsufficientFunds => "FAUCET_EMPTY",
            FaucetError::TransferFailed(_) => "TRANSFER_FAILED",
            FaucetError::Store(_)
            | FaucetError::Distributor(_)
            | FaucetError::Config(_)
            | FaucetError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            FaucetError::InvalidAddress => StatusCode::BAD_REQUEST,
            FaucetError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
            FaucetError::InsufficientFunds => StatusCode::SERVICE_UNAVAILABLE,
            FaucetError::Distributor(DistributorError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-facing message. Internal causes stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            FaucetError::InvalidAddress => "Invalid address".to_string(),
            FaucetError::Throttled(remaining) => {
                format!("Already claimed. Try again in ~{:.2} hours.", hours(remaining))
            }
            FaucetError::InsufficientFunds => "Faucet is empty".to_string(),
            FaucetError::TransferFailed(_) => "Transfer failed. Please try again later.".to_string(),
            _ => "Internal faucet error".to_string(),
        }
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.code(),
            "message": self.public_message(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        if let FaucetError::Throttled(remaining) = &self {
            body["remainingHours"] = json!(format!("{:.2}", hours(remaining)));
        }

        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(FaucetError::InvalidAddress.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            FaucetError::Throttled(Duration::from_secs(60)).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            FaucetError::InsufficientFunds.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            FaucetError::TransferFailed(DistributorError::Rejected("nonce too low".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_public_message_hides_causes() {
        let err = FaucetError::TransferFailed(DistributorError::Rejected(
            "insufficient funds for gas * price + value".into(),
        ));
        assert!(!err.public_message().contains("gas"));

        let err = FaucetError::Store(StoreError::RestKv("401 unauthorized".into()));
        assert_eq!(err.public_message(), "Internal faucet error");
    }

    #[test]
    fn test_throttled_message_has_two_decimals() {
        let err = FaucetError::Throttled(Duration::from_secs(11 * 3600));
        assert_eq!(err.public_message(), "Already claimed. Try again in ~11.00 hours.");
    }

    #[test]
    fn test_distributor_errors_compare_by_value() {
        let a = DistributorError::Ambiguous {
            tx_hash: Some("0xabc".into()),
            reason: "timeout".into(),
        };
        assert_eq!(a.clone(), a);
        assert_ne!(a, DistributorError::Unavailable("timeout".into()));
    }
}
