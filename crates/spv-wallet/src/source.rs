//! Block provider abstraction.
//!
//! The sync loop pulls full blocks through this trait; the concrete
//! implementation (a P2P node pool, an HTTP block service) stays out of
//! the engine. Returning `Ok(None)` signals that the requested header
//! is no longer on the provider's best chain, which the engine treats
//! as a reorg at that height.

use async_trait::async_trait;
use bitcoin::{Block, BlockHash};
use tokio_util::sync::CancellationToken;

use crate::error::WalletError;

#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the block with `hash` expected at `height`.
    ///
    /// `Ok(None)` means the provider no longer considers that header
    /// part of the best chain. Implementations should return promptly
    /// once `cancel` fires.
    async fn next_block(
        &self,
        height: u32,
        hash: BlockHash,
        cancel: &CancellationToken,
    ) -> Result<Option<Block>, WalletError>;

    /// Drop current connections after a stall or fetch failure so the
    /// next request starts from fresh peers.
    async fn purge(&self, reason: &str);

    /// Number of currently connected peers.
    fn connected_peers(&self) -> usize;

    /// Opaque serialized peer address cache, persisted across runs.
    fn peer_cache(&self) -> Vec<u8>;
}
