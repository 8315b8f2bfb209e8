//! Exchange error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Error returned by an exchange call
///
/// Transient variants are safe to retry; everything else is terminal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("rate limited (code {code}): {message}")]
    RateLimited {
        code: i64,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("rejected by exchange (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited { .. }
                | ExchangeError::Timeout(_)
                | ExchangeError::Network(_)
                | ExchangeError::Server { .. }
        )
    }

    /// The request may have reached the matching engine before the error
    ///
    /// Rate limits and rejections are refused up front; a timeout, a dropped
    /// connection or a 5xx leaves the order's fate unknown.
    pub fn may_have_executed(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_) | ExchangeError::Network(_) | ExchangeError::Server { .. }
        )
    }

    /// Exchange error code, when the exchange supplied one
    pub fn code(&self) -> Option<i64> {
        match self {
            ExchangeError::RateLimited { code, .. } | ExchangeError::Rejected { code, .. } => {
                Some(*code)
            }
            ExchangeError::Server { status, .. } => Some(i64::from(*status)),
            _ => None,
        }
    }

    /// Suggested wait before retrying, if the exchange sent one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a Binance error body (`{"code": -2019, "msg": "..."}`) and HTTP status
    pub fn classify(http_status: u16, code: i64, message: &str) -> Self {
        match (http_status, code) {
            (429 | 418, _) | (_, -1003 | -1015) => ExchangeError::RateLimited {
                code,
                message: message.to_string(),
                retry_after: None,
            },
            // -1001 disconnected, -1007 backend timeout, -1021 timestamp outside recvWindow
            (_, -1001 | -1006 | -1007 | -1021) => ExchangeError::Timeout(format!(
                "code {}: {}",
                code, message
            )),
            (500..=599, _) => ExchangeError::Server {
                status: http_status,
                message: message.to_string(),
            },
            _ => ExchangeError::Rejected {
                code,
                message: message.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_decode() {
            ExchangeError::InvalidResponse(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::InvalidResponse(err.to_string())
    }
}
