//! Error types for counter synchronization

use crate::types::ActionKind;
use alloy::transports::TransportError;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration fetch failed or returned not-ready
    #[error("Configuration unavailable: {0}")]
    ConfigUnavailable(String),

    /// Active network differs from the one the contract lives on
    #[error("Wrong network: connected to chain {active}, expected chain {expected}")]
    NetworkMismatch {
        /// Chain id reported by the wallet
        active: u64,
        /// Chain id from configuration
        expected: u64,
    },

    /// Wallet not connected or contract address missing
    #[error("Not connected")]
    NotConnected,

    /// Transient read failure
    #[error("Read failure: {0}")]
    ReadFailure(String),

    /// Signing declined or pre-flight error
    #[error("{kind} rejected: {message}")]
    WriteRejected {
        /// Action that was being submitted
        kind: ActionKind,
        /// Wallet or node message
        message: String,
    },

    /// Submitted transaction failed on-chain
    #[error("Transaction reverted{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    WriteReverted {
        /// Decoded revert reason, when the node returned one
        reason: Option<String>,
    },

    /// Follow-up lookup for an activity entry failed
    #[error("Enrichment failure: {0}")]
    EnrichmentFailure(String),

    /// JSON-RPC error object returned by the node
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
    },

    /// Call did not complete within the per-call timeout
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed data returned by the node
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Node unreachable or returned something other than a JSON-RPC response
    #[error("Transport error: {0}")]
    Transport(String),

    /// Node URL could not be parsed
    #[error("Invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    /// Malformed hex, such as an address in configuration
    #[error(transparent)]
    InvalidHex(#[from] alloy::primitives::hex::FromHexError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e.as_error_resp() {
            Some(payload) => Error::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
            },
            None => Error::Transport(e.to_string()),
        }
    }
}

impl Error {
    /// Whether this error is shown to the operator.
    ///
    /// Everything else is contained: logged, retried, or degraded.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::ConfigUnavailable(_)
                | Error::NetworkMismatch { .. }
                | Error::NotConnected
                | Error::WriteRejected { .. }
                | Error::WriteReverted { .. }
        )
    }

    /// Whether the same call may succeed if issued again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Rpc { .. }
                | Error::Http(_)
                | Error::Transport(_)
                | Error::ReadFailure(_)
                | Error::ConfigUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_visibility_policy() {
        assert!(Error::NotConnected.is_user_visible());
        assert!(Error::WriteReverted { reason: None }.is_user_visible());
        assert!(!Error::ReadFailure("boom".into()).is_user_visible());
        assert!(!Error::EnrichmentFailure("boom".into()).is_user_visible());
        assert!(!Error::Timeout(Duration::from_secs(15)).is_user_visible());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::Rpc {
            code: -32000,
            message: "header not found".into()
        }
        .is_retryable());
        assert!(!Error::WriteRejected {
            kind: ActionKind::Increment,
            message: "User rejected the request".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_transport_error_mapping() {
        let payload = alloy::rpc::json_rpc::ErrorPayload {
            code: -32000,
            message: "header not found".into(),
            data: None,
        };
        let err = Error::from(TransportError::ErrorResp(payload));
        assert!(matches!(err, Error::Rpc { code: -32000, ref message } if message == "header not found"));

        let err = Error::from(TransportError::NullResp);
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_bad_address_is_hex_error() {
        let err: Error = "0xnot-an-address"
            .parse::<crate::types::Address>()
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::InvalidHex(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_revert_message() {
        let err = Error::WriteReverted {
            reason: Some("Counter: underflow".into()),
        };
        assert_eq!(err.to_string(), "Transaction reverted: Counter: underflow");
        assert_eq!(
            Error::WriteReverted { reason: None }.to_string(),
            "Transaction reverted"
        );
    }
}
