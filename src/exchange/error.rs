//! Gateway error taxonomy.
//!
//! Callers branch on the kind: transient failures are retried under the
//! retry policy, rejections are never retried blindly, and unknown outcomes
//! (timeouts, 5xx) are deferred to the next reconciliation for mutations.

use std::time::Duration;
use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failure of a single exchange gateway call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Request was not processed (network, rate limit, clock skew). Safe to retry.
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Request may or may not have been executed.
    #[error("outcome unknown: {0}")]
    Unknown(String),
    /// Request reached the exchange and was refused.
    #[error("rejected by exchange (code {code}): {message}")]
    Rejected { code: i64, message: String },
    /// Order id or client order id is not known to the exchange.
    #[error("order not known to the exchange")]
    UnknownOrder,
    /// Response could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Timeout of a whole call, surfaced as an unknown outcome.
    pub fn timeout(op: &str, after: Duration) -> Self {
        GatewayError::Unknown(format!("{} timed out after {:?}", op, after))
    }

    /// Retryable for every kind of call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// The request may have taken effect.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, GatewayError::Unknown(_))
    }

    /// Classify a Binance error payload and HTTP status.
    ///
    /// Binance documents 5xx as "execution status unknown", so those are not
    /// treated as plain failures.
    pub fn from_binance(http_status: u16, code: i64, message: &str) -> Self {
        match (http_status, code) {
            (429 | 418, _) => GatewayError::Transient(format!("rate limited: {}", message)),
            (500..=599, _) => GatewayError::Unknown(format!("HTTP {}: {}", http_status, message)),
            // Internal error / too many requests / too many orders / timestamp outside recvWindow
            (_, -1001 | -1003 | -1015 | -1021) => GatewayError::Transient(message.to_string()),
            // Backend timeout, send status unknown
            (_, -1006 | -1007) => GatewayError::Unknown(message.to_string()),
            // Unknown order sent / order does not exist
            (_, -2011 | -2013) => GatewayError::UnknownOrder,
            _ => GatewayError::Rejected {
                code,
                message: message.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Unknown(err.to_string())
        } else if err.is_connect() {
            GatewayError::Transient(err.to_string())
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Unknown(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_classification() {
        assert!(GatewayError::from_binance(429, -1003, "Too many requests").is_retryable());
        assert!(GatewayError::from_binance(400, -1021, "Timestamp outside recvWindow").is_retryable());
        assert!(GatewayError::from_binance(503, 0, "Service unavailable").is_unknown_outcome());
        assert_eq!(
            GatewayError::from_binance(400, -2011, "Unknown order sent."),
            GatewayError::UnknownOrder
        );

        let rejected = GatewayError::from_binance(
            400,
            -2010,
            "Account has insufficient balance for requested action.",
        );
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_unknown_outcome());
        assert!(matches!(rejected, GatewayError::Rejected { code: -2010, .. }));
    }

    #[test]
    fn test_timeout_is_unknown_outcome() {
        let err = GatewayError::timeout("place_order", Duration::from_secs(10));
        assert!(err.is_unknown_outcome());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("place_order"));
    }
}
