//! Transaction broadcast with fallback.
//!
//! The primary service's own success signal is unreliable, so every
//! attempt is followed by a presence poll; only a positive poll counts.
//! After the retry budget is exhausted, an invalid/unknown rejection
//! from the primary triggers exactly one push through the fallback
//! service, whose JSON success field is authoritative.

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize;
use bitcoin::{Transaction, Txid};
use spv_rpc::{PushTxClient, PushTxResponse, RpcError};

use crate::error::WalletError;

pub const BROADCAST_ATTEMPTS: u32 = 7;
pub const BROADCAST_RETRY_DELAY: Duration = Duration::from_secs(3);

/// BIP61-style reject code for an invalid transaction.
const REJECT_INVALID: i32 = 16;

/// Rejection detail reported by the primary broadcast service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRejection {
    pub code: i32,
    pub reason: String,
}

impl BroadcastRejection {
    /// Only the opaque invalid rejection (code 16 with the literal
    /// "Unknown" reason) justifies the fallback; a rejection with a
    /// concrete reason (low fee, bad inputs, mempool conflict) would
    /// fail there too.
    fn triggers_fallback(&self) -> bool {
        self.code == REJECT_INVALID && self.reason == "Unknown"
    }
}

/// Outcome of one primary broadcast attempt.
#[derive(Debug, Clone, Default)]
pub struct BroadcastResponse {
    pub rejection: Option<BroadcastRejection>,
}

/// Primary broadcast/query service.
#[async_trait]
pub trait BroadcastApi: Send + Sync {
    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastResponse, RpcError>;

    /// Whether the service already knows the transaction.
    async fn transaction_present(&self, txid: &Txid) -> Result<bool, RpcError>;
}

/// Fallback push service; the concrete client is HTTP.
#[async_trait]
pub trait FallbackApi: Send + Sync {
    async fn push(&self, tx_hex: &str) -> Result<PushTxResponse, RpcError>;
}

#[async_trait]
impl FallbackApi for PushTxClient {
    async fn push(&self, tx_hex: &str) -> Result<PushTxResponse, RpcError> {
        PushTxClient::push(self, tx_hex).await
    }
}

/// How a successfully sent transaction reached the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Primary,
    Fallback,
}

/// Broadcast `tx` until the primary service reports it present, then
/// fall back once if the primary kept rejecting it as invalid/unknown.
pub async fn send_transaction(
    primary: &dyn BroadcastApi,
    fallback: &dyn FallbackApi,
    tx: &Transaction,
) -> Result<Propagation, WalletError> {
    let txid = tx.compute_txid();
    let mut last_rejection: Option<BroadcastRejection> = None;

    for attempt in 1..=BROADCAST_ATTEMPTS {
        match primary.broadcast(tx).await {
            Ok(response) => {
                if let Some(rejection) = response.rejection {
                    log::warn!(
                        "broadcast attempt {}/{} rejected: code {} ({})",
                        attempt,
                        BROADCAST_ATTEMPTS,
                        rejection.code,
                        rejection.reason
                    );
                    last_rejection = Some(rejection);
                }
            }
            Err(e) => log::warn!(
                "broadcast attempt {}/{} failed: {}",
                attempt,
                BROADCAST_ATTEMPTS,
                e
            ),
        }

        match primary.transaction_present(&txid).await {
            Ok(true) => {
                log::info!("transaction {} accepted by the network", txid);
                return Ok(Propagation::Primary);
            }
            Ok(false) => {}
            Err(e) => log::warn!("presence poll for {} failed: {}", txid, e),
        }

        if attempt < BROADCAST_ATTEMPTS {
            tokio::time::sleep(BROADCAST_RETRY_DELAY).await;
        }
    }

    if last_rejection
        .as_ref()
        .map_or(false, |r| r.triggers_fallback())
    {
        log::info!("primary exhausted, trying fallback broadcast for {}", txid);
        let tx_hex = hex::encode(serialize(tx));
        let response = fallback.push(&tx_hex).await?;
        if response.success {
            return Ok(Propagation::Fallback);
        }
        return Err(WalletError::Broadcast(format!(
            "fallback rejected transaction {}: {}",
            txid,
            response.describe_error()
        )));
    }

    Err(WalletError::Broadcast(match last_rejection {
        Some(r) => format!("transaction {} rejected: code {} ({})", txid, r.code, r.reason),
        None => format!("transaction {} never appeared on the network", txid),
    }))
}
