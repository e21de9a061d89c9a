/*
[INPUT]:  Error sources (HTTP transport, exchange API codes, serialization)
[OUTPUT]: Structured error types with retry hints
[POS]:    Error handling layer - unified error type for the adapter crate
[UPDATE]: When adding new error sources or exchange error classes
*/

use thiserror::Error;

/// Main error type for the USD-M futures adapter.
///
/// Expected exchange rejections (insufficient funds, invalid order,
/// post-only cross) are never surfaced here; they are folded into
/// `OrderResult` by the trade endpoints. This type carries everything else.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// HTTP transport failed (connect, timeout, TLS, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Exchange returned an error payload `{code, msg}`.
    #[error("exchange error (code {code}): {message}")]
    Api { code: i64, message: String },

    /// Response did not match the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL construction failed.
    #[error("invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Client misconfiguration (bad proxy, empty credentials).
    #[error("configuration error: {0}")]
    Config(String),
}

impl AdapterError {
    pub fn api(code: i64, message: impl Into<String>) -> Self {
        AdapterError::Api {
            code,
            message: message.into(),
        }
    }

    /// Transport-shaped failures are worth retrying; API rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Http(_) | AdapterError::WebSocket(_) | AdapterError::InvalidResponse(_)
        )
    }

    /// Exchange error code, when this is an API error.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            AdapterError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_are_not_retryable() {
        let err = AdapterError::api(-5022, "Post Only order rejected");
        assert!(!err.is_retryable());
        assert_eq!(err.api_code(), Some(-5022));
    }

    #[test]
    fn invalid_response_is_retryable() {
        assert!(AdapterError::InvalidResponse("truncated".into()).is_retryable());
    }
}
