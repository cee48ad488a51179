//! Persistence scheduler.
//!
//! Periodically (and on demand) flushes the peer cache, header chain
//! and tracker snapshot under the working-data root. Peer cache and
//! header chain writes are serialized through one async exclusive
//! section; the chain and tracker are only rewritten when their height
//! strictly increased since the last write. Save failures are logged
//! and retried on the next cycle, never fatal.
//!
//! Layout: `peers-{network}.dat`, `headerchain-{network}.dat`, and one
//! `{wallet_id}/` directory for the tracker snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use spv_types::Network;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chain::HeaderChain;
use crate::error::WalletError;
use crate::source::BlockSource;
use crate::tracker::Tracker;

pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(3 * 60);

pub struct Persister {
    data_dir: PathBuf,
    network: Network,
    wallet_id: String,
    chain: Arc<RwLock<HeaderChain>>,
    tracker: Arc<RwLock<Tracker>>,
    source: Arc<dyn BlockSource>,
    interval: Duration,
    // Exclusive section for peer-cache and header-chain writes; holds
    // the last chain height written.
    chain_watermark: Mutex<Option<u32>>,
    tracker_watermark: Mutex<Option<u32>>,
}

impl Persister {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_dir: PathBuf,
        network: Network,
        wallet_id: String,
        chain: Arc<RwLock<HeaderChain>>,
        tracker: Arc<RwLock<Tracker>>,
        source: Arc<dyn BlockSource>,
        interval: Duration,
        saved_chain_height: Option<u32>,
        saved_tracker_height: Option<u32>,
    ) -> Self {
        Self {
            data_dir,
            network,
            wallet_id,
            chain,
            tracker,
            source,
            interval,
            chain_watermark: Mutex::new(saved_chain_height),
            tracker_watermark: Mutex::new(saved_tracker_height),
        }
    }

    pub fn peer_cache_path(data_dir: &Path, network: Network) -> PathBuf {
        data_dir.join(format!("peers-{}.dat", network))
    }

    pub fn header_chain_path(data_dir: &Path, network: Network) -> PathBuf {
        data_dir.join(format!("headerchain-{}.dat", network))
    }

    pub fn tracker_dir(data_dir: &Path, wallet_id: &str) -> PathBuf {
        data_dir.join(wallet_id)
    }

    /// Flush everything that changed since the last write.
    pub async fn save_all_changed(&self) -> Result<(), WalletError> {
        {
            let mut saved = self.chain_watermark.lock().await;
            fs::create_dir_all(&self.data_dir)?;
            fs::write(
                Self::peer_cache_path(&self.data_dir, self.network),
                self.source.peer_cache(),
            )?;
            let chain = self.chain.read().await;
            let height = chain.height();
            if saved.map_or(true, |h| height > h) {
                fs::write(
                    Self::header_chain_path(&self.data_dir, self.network),
                    chain.to_bytes(),
                )?;
                *saved = Some(height);
                log::debug!("header chain saved at height {}", height);
            }
        }

        let mut saved = self.tracker_watermark.lock().await;
        let tracker = self.tracker.read().await;
        if let Some(best) = tracker.best_height().as_chain() {
            if saved.map_or(true, |h| best > h) {
                tracker.save(&Self::tracker_dir(&self.data_dir, &self.wallet_id))?;
                *saved = Some(best);
                log::debug!("tracker snapshot saved at height {}", best);
            }
        }
        Ok(())
    }

    /// Periodic save loop; runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.save_all_changed().await {
                log::warn!("periodic save failed, will retry: {}", e);
            }
        }
    }
}
