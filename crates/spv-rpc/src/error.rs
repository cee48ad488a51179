//! HTTP backend error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}

impl RpcError {
    /// Whether a retry could plausibly succeed: transport trouble or a
    /// server-side (5xx) status.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Http(e) => e.is_timeout() || e.is_connect(),
            RpcError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}
