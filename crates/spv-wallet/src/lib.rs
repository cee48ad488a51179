//! SPV wallet engine.
//!
//! Maintains an eventually consistent view of wallet-relevant
//! transactions by walking a block-header chain and downloading only
//! the blocks past the wallet's creation height, and exposes balance
//! and history queries plus transaction construction and broadcast.
//!
//! The [`WalletEngine`] ties everything together; collaborators that
//! talk to the outside world (block fetching, primary broadcast, fee
//! quotes) are traits, with concrete HTTP backends in `spv-rpc` and the
//! BIP32 key vault in [`safe`].

pub mod broadcast;
pub mod builder;
pub mod chain;
pub mod engine;
pub mod error;
pub mod history;
pub mod persist;
pub mod safe;
pub mod source;
pub mod sync;
pub mod tracker;
pub mod tracking;

pub use broadcast::{BroadcastApi, BroadcastRejection, BroadcastResponse, FallbackApi, Propagation};
pub use builder::{BuiltTransaction, FeeEstimator};
pub use chain::HeaderChain;
pub use engine::{EngineConfig, WalletEngine};
pub use error::{BuildError, WalletError};
pub use history::{Balance, Coin, SafeHistoryRecord};
pub use safe::{KeySource, Safe};
pub use source::BlockSource;
pub use sync::find_creation_height;
pub use tracker::{SmartTransaction, Tracker};
pub use tracking::update_tracking;
