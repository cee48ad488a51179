//! Shared HTTP client configuration and retry policy.

use std::future::Future;
use std::time::Duration;

use crate::error::RpcError;

/// Configuration for the backend HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt, transient failures only.
    pub retries: u32,
    /// Base delay before the first retry; doubles per retry.
    pub retry_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl HttpConfig {
    /// Build a `reqwest` client with this configuration applied.
    pub fn build(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to create HTTP client")
    }
}

/// Run `op`, retrying transient failures with exponential back-off.
/// Permanent failures return immediately.
pub(crate) async fn with_retries<T, F, Fut>(
    retries: u32,
    retry_delay: Duration,
    mut op: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retries => {
                let delay = retry_delay * 2u32.saturating_pow(attempt);
                log::debug!("transient backend failure, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
