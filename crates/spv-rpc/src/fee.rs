//! Fee-rate client.
//!
//! Fetches a per-kilobyte fee schedule and converts it to integer
//! satoshis per byte (divide by 1024, truncate).

use std::time::Duration;

use serde::Deserialize;
use spv_types::{FeeTier, Network};

use crate::client::{with_retries, HttpConfig};
use crate::endpoints;
use crate::error::RpcError;

/// Fee schedule as reported by the backend, in satoshis per 1000 bytes.
///
/// The backend reports decimal values, hence the floating-point fields.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FeeSchedule {
    pub high_fee_per_kb: f64,
    pub medium_fee_per_kb: f64,
    pub low_fee_per_kb: f64,
}

impl FeeSchedule {
    /// Integer satoshis per byte for the given tier.
    pub fn sat_per_byte(&self, tier: FeeTier) -> u64 {
        let per_kb = match tier {
            FeeTier::High => self.high_fee_per_kb,
            FeeTier::Medium => self.medium_fee_per_kb,
            FeeTier::Low => self.low_fee_per_kb,
        };
        (per_kb / 1024.0) as u64
    }
}

/// Async client for the fee-schedule endpoint.
pub struct FeeClient {
    client: reqwest::Client,
    url: String,
    retries: u32,
    retry_delay: Duration,
}

impl FeeClient {
    /// Create a client against an explicit endpoint URL.
    pub fn new(url: &str) -> Self {
        Self::with_config(url, &HttpConfig::default())
    }

    /// Create a client against the well-known endpoint for `network`.
    pub fn for_network(network: Network) -> Self {
        Self::new(endpoints::fee_url(network))
    }

    pub fn with_config(url: &str, config: &HttpConfig) -> Self {
        Self {
            client: config.build(),
            url: url.trim_end_matches('/').to_string(),
            retries: config.retries,
            retry_delay: config.retry_delay,
        }
    }

    /// The configured endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the current fee schedule, retrying transient failures.
    pub async fn fee_schedule(&self) -> Result<FeeSchedule, RpcError> {
        with_retries(self.retries, self.retry_delay, || self.fetch_schedule()).await
    }

    async fn fetch_schedule(&self) -> Result<FeeSchedule, RpcError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }
        let schedule = response.json::<FeeSchedule>().await?;
        log::debug!(
            "fee schedule: high={} medium={} low={} sat/kB",
            schedule.high_fee_per_kb,
            schedule.medium_fee_per_kb,
            schedule.low_fee_per_kb
        );
        Ok(schedule)
    }

    /// Fetch the schedule and resolve one tier to integer sat/byte.
    pub async fn sat_per_byte(&self, tier: FeeTier) -> Result<u64, RpcError> {
        Ok(self.fee_schedule().await?.sat_per_byte(tier))
    }
}
