//! HTTP backends for the SPV wallet engine.
//!
//! Provides the async fee-rate client (per-kilobyte fee schedule turned
//! into integer satoshis per byte) and the fallback push-transaction
//! client used when the primary broadcast path cannot confirm
//! propagation.
//!
//! # Example
//!
//! ```ignore
//! use spv_rpc::FeeClient;
//! use spv_types::{FeeTier, Network};
//!
//! #[tokio::main]
//! async fn main() {
//!     let fees = FeeClient::for_network(Network::Main);
//!     let rate = fees.sat_per_byte(FeeTier::Medium).await.unwrap();
//!     println!("medium: {} sat/byte", rate);
//! }
//! ```

pub mod client;
pub mod error;
pub mod fee;
pub mod pushtx;

pub use client::HttpConfig;
pub use error::RpcError;
pub use fee::{FeeClient, FeeSchedule};
pub use pushtx::{PushTxClient, PushTxError, PushTxResponse};

/// Well-known endpoints per network.
pub mod endpoints {
    use spv_types::Network;

    /// Fee-schedule endpoints (blockcypher chain info).
    pub const FEE_MAIN: &str = "https://api.blockcypher.com/v1/btc/main";
    pub const FEE_TEST: &str = "https://api.blockcypher.com/v1/btc/test3";

    /// Fallback push-transaction endpoints.
    pub const PUSHTX_MAIN: &str = "https://api.smartbit.com.au/v1/blockchain/pushtx";
    pub const PUSHTX_TEST: &str = "https://testnet-api.smartbit.com.au/v1/blockchain/pushtx";

    pub fn fee_url(network: Network) -> &'static str {
        match network {
            Network::Main => FEE_MAIN,
            Network::Test => FEE_TEST,
        }
    }

    pub fn pushtx_url(network: Network) -> &'static str {
        match network {
            Network::Main => PUSHTX_MAIN,
            Network::Test => PUSHTX_TEST,
        }
    }
}
