//! Block synchronization loop.
//!
//! Single-flight download driver: resolves the wallet creation height
//! from header times, then pulls blocks one at a time from the
//! [`BlockSource`](crate::source::BlockSource) into the tracker's
//! block buffer, pausing while the buffer is full. A stale fetch
//! (`Ok(None)`) rewinds one block; deep reorgs resolve over successive
//! iterations. Every iteration failure is logged and retried.

use std::sync::Arc;
use std::time::Duration;

use spv_types::{Height, WalletState};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chain::HeaderChain;
use crate::error::WalletError;
use crate::safe::KeySource;
use crate::source::BlockSource;
use crate::tracker::Tracker;

/// Upper bound on a single block download.
pub const BLOCK_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(360);

const RETRY_WAIT: Duration = Duration::from_secs(1);
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(100);

/// What the next iteration should do, decided from a consistent read of
/// chain and tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    /// Header chain does not yet reach the wallet's creation time.
    WaitingForCreationHeight,
    /// Creation height known but headers lag behind it.
    WaitingForHeaderCatchup,
    /// Tracker has caught the header tip.
    CaughtUp,
    /// Downloaded-but-unapplied blocks block further fetches.
    Backpressure,
    Download(u32),
}

/// First height at or below the tip whose header time does not exceed
/// the wallet creation time, walking back from the tip.
///
/// `Unknown` while the tip itself predates the wallet (or any wallet),
/// meaning headers have not caught up far enough to decide.
pub fn find_creation_height(chain: &HeaderChain, keys: &dyn KeySource) -> Height {
    let Some(tip_time) = chain.time_at(chain.height()) else {
        return Height::Unknown;
    };
    if tip_time < keys.earliest_possible_creation_time() || tip_time < keys.creation_time() {
        return Height::Unknown;
    }
    let creation = keys.creation_time();
    let mut height = chain.height();
    while height > chain.base_height() {
        match chain.time_at(height) {
            Some(t) if t > creation => height -= 1,
            _ => break,
        }
    }
    Height::Chain(height)
}

pub struct SyncLoop {
    chain: Arc<RwLock<HeaderChain>>,
    tracker: Arc<RwLock<Tracker>>,
    keys: Arc<dyn KeySource>,
    source: Arc<dyn BlockSource>,
    state: Arc<watch::Sender<WalletState>>,
    creation_height: Option<u32>,
}

impl SyncLoop {
    pub fn new(
        chain: Arc<RwLock<HeaderChain>>,
        tracker: Arc<RwLock<Tracker>>,
        keys: Arc<dyn KeySource>,
        source: Arc<dyn BlockSource>,
        state: Arc<watch::Sender<WalletState>>,
    ) -> Self {
        Self {
            chain,
            tracker,
            keys,
            source,
            state,
            creation_height: None,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!("sync loop started");
        while !cancel.is_cancelled() {
            if let Err(e) = self.iterate(&cancel).await {
                log::warn!("sync iteration failed, retrying: {}", e);
            }
        }
        log::info!("sync loop stopped");
    }

    async fn iterate(&mut self, cancel: &CancellationToken) -> Result<(), WalletError> {
        match self.plan().await {
            SyncPhase::WaitingForCreationHeight | SyncPhase::WaitingForHeaderCatchup => {
                wait(RETRY_WAIT, cancel).await;
                Ok(())
            }
            SyncPhase::CaughtUp => {
                self.set_state(WalletState::Synced);
                wait(BACKPRESSURE_WAIT, cancel).await;
                Ok(())
            }
            SyncPhase::Backpressure => {
                wait(BACKPRESSURE_WAIT, cancel).await;
                Ok(())
            }
            SyncPhase::Download(target) => self.download(target, cancel).await,
        }
    }

    async fn plan(&mut self) -> SyncPhase {
        let chain = self.chain.read().await;
        let creation = match self.creation_height {
            Some(h) => h,
            None => match find_creation_height(&chain, self.keys.as_ref()) {
                Height::Chain(h) => {
                    log::info!("wallet creation height resolved to {}", h);
                    self.creation_height = Some(h);
                    h
                }
                _ => return SyncPhase::WaitingForCreationHeight,
            },
        };
        let chain_height = chain.height();
        if chain_height < creation {
            return SyncPhase::WaitingForHeaderCatchup;
        }

        let tracker = self.tracker.read().await;
        let best = tracker.best_height().as_chain();
        if best.map_or(false, |b| chain_height <= b) {
            return SyncPhase::CaughtUp;
        }
        let buffer_best = tracker.buffer_best_height().as_chain();
        if buffer_best.map_or(false, |b| b >= chain_height) || tracker.buffer_full() {
            return SyncPhase::Backpressure;
        }
        match (best, buffer_best) {
            (None, None) => SyncPhase::Download(creation),
            (b, f) => SyncPhase::Download(b.unwrap_or(0).max(f.unwrap_or(0)) + 1),
        }
    }

    async fn download(&mut self, target: u32, cancel: &CancellationToken) -> Result<(), WalletError> {
        let hash = {
            let chain = self.chain.read().await;
            match chain.header_at(target) {
                Some(header) => header.block_hash(),
                None => {
                    wait(RETRY_WAIT, cancel).await;
                    return Ok(());
                }
            }
        };
        self.set_state(WalletState::SyncingBlocks);

        // The fetch sees one token covering both external cancellation
        // and the download timeout.
        let fetch_cancel = cancel.child_token();
        let fetched = tokio::time::timeout(
            BLOCK_DOWNLOAD_TIMEOUT,
            self.source.next_block(target, hash, &fetch_cancel),
        )
        .await;
        match fetched {
            Err(_) => {
                fetch_cancel.cancel();
                if !cancel.is_cancelled() {
                    self.source.purge("block download timed out").await;
                }
                Ok(())
            }
            Ok(Err(e)) => {
                if !cancel.is_cancelled() {
                    self.source.purge("block download failed").await;
                }
                Err(e)
            }
            Ok(Ok(None)) => self.handle_reorg().await,
            Ok(Ok(Some(block))) => {
                self.tracker.write().await.add_or_replace_block(target, block);
                Ok(())
            }
        }
    }

    /// Rewind the header tip and tracker by exactly one block.
    async fn handle_reorg(&mut self) -> Result<(), WalletError> {
        let height = {
            let mut chain = self.chain.write().await;
            let height = chain.height();
            chain.rewind_tip()?;
            height
        };
        self.tracker.write().await.reorg_one();
        log::info!("reorg: rewound block at height {}", height);
        Ok(())
    }

    fn set_state(&self, next: WalletState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                log::info!("wallet state: {:?} -> {:?}", current, next);
                *current = next;
                true
            }
        });
    }
}

async fn wait(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
