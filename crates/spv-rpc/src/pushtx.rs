//! Fallback push-transaction client.
//!
//! POSTs a raw transaction hex to the secondary broadcast service. Unlike
//! the primary broadcast path, this service's JSON `success` field is
//! treated as authoritative.

use serde::{Deserialize, Serialize};
use spv_types::Network;

use crate::client::HttpConfig;
use crate::endpoints;
use crate::error::RpcError;

#[derive(Debug, Serialize)]
struct PushTxRequest<'a> {
    hex: &'a str,
}

/// Error object embedded in a push-transaction response.
#[derive(Debug, Clone, Deserialize)]
pub struct PushTxError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Push-transaction response.
#[derive(Debug, Clone, Deserialize)]
pub struct PushTxResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<PushTxError>,
}

impl PushTxResponse {
    /// Human-readable description of the failure, if any.
    pub fn describe_error(&self) -> String {
        match &self.error {
            Some(err) => format!(
                "code: {} reason: {}",
                err.code.as_deref().unwrap_or("?"),
                err.message.as_deref().unwrap_or("?")
            ),
            None => "no error details".to_string(),
        }
    }
}

/// Async client for the push-transaction endpoint.
pub struct PushTxClient {
    client: reqwest::Client,
    url: String,
}

impl PushTxClient {
    pub fn new(url: &str) -> Self {
        Self::with_config(url, &HttpConfig::default())
    }

    /// Create a client against the well-known endpoint for `network`.
    pub fn for_network(network: Network) -> Self {
        Self::new(endpoints::pushtx_url(network))
    }

    pub fn with_config(url: &str, config: &HttpConfig) -> Self {
        Self {
            client: config.build(),
            url: url.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a raw transaction (hex-encoded).
    pub async fn push(&self, tx_hex: &str) -> Result<PushTxResponse, RpcError> {
        let response = self
            .client
            .post(&self.url)
            .json(&PushTxRequest { hex: tx_hex })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }
        let parsed = response.json::<PushTxResponse>().await?;
        if parsed.success {
            log::info!("fallback broadcast accepted");
        } else {
            log::warn!("fallback broadcast rejected: {}", parsed.describe_error());
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success_parses() {
        let json = r#"{"success": true}"#;
        let parsed: PushTxResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.success);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_response_error_parses() {
        let json = r#"{
            "success": false,
            "error": { "code": "TX_INVALID", "message": "transaction rejected" }
        }"#;
        let parsed: PushTxResponse = serde_json::from_str(json).unwrap();
        assert!(!parsed.success);
        let described = parsed.describe_error();
        assert!(described.contains("TX_INVALID"));
        assert!(described.contains("transaction rejected"));
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(PushTxRequest { hex: "00aa" }).unwrap();
        assert_eq!(body, serde_json::json!({ "hex": "00aa" }));
    }

    #[test]
    fn test_network_endpoints() {
        assert!(PushTxClient::for_network(Network::Test)
            .url()
            .contains("testnet"));
        assert!(!PushTxClient::for_network(Network::Main)
            .url()
            .contains("testnet"));
    }
}
