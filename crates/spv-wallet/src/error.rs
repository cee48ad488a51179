//! Wallet error types.

use bitcoin::Amount;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("account is not tracked: {0}")]
    InvalidAccount(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("header chain error: {0}")]
    Chain(String),

    #[error("key lookup failed: {0}")]
    Key(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] spv_rpc::RpcError),

    #[error("block fetch failed: {0}")]
    Fetch(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("{0}")]
    Other(String),
}

/// Failure modes of transaction building.
///
/// These are expected outcomes a caller branches on, not programming
/// errors; insufficient funds in particular must stay distinguishable
/// from a fee-query or verification failure.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("fee query failed: {0}")]
    FeeQuery(String),

    #[error("insufficient funds: need {need}, available {available}")]
    InsufficientFunds { need: Amount, available: Amount },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("built transaction failed self-verification")]
    Verification,
}

impl BuildError {
    /// True for the insufficient-funds outcome.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, BuildError::InsufficientFunds { .. })
    }
}
