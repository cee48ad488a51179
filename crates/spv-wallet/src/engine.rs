//! Wallet engine context.
//!
//! Owns the header chain, tracker, collaborator services and all
//! notification channels; every operation goes through this value
//! rather than process-wide state. `start` runs the sync loop, block
//! application, the persistence scheduler and the
//! tracking/notification task until cancelled, then restores
//! `NotStarted` and performs a final save.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Amount, ScriptBuf, Transaction};
use spv_types::{FeeTier, Height, Network, SafeAccount, WalletState};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{self, BroadcastApi, FallbackApi, Propagation};
use crate::builder::{self, BuiltTransaction, FeeEstimator};
use crate::chain::HeaderChain;
use crate::error::{BuildError, WalletError};
use crate::history::{self, Balance, Coin, SafeHistoryRecord};
use crate::persist::{Persister, DEFAULT_SAVE_INTERVAL};
use crate::safe::{bitcoin_network, KeySource};
use crate::source::BlockSource;
use crate::sync::SyncLoop;
use crate::tracker::{SmartTransaction, Tracker};
use crate::tracking::{update_tracking, DEFAULT_MAX_CLEAN_ADDRESS_COUNT};

const PEER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const BLOCK_APPLY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub network: Network,
    /// Working-data root for persisted state.
    pub data_dir: PathBuf,
    /// Names the tracker snapshot directory.
    pub wallet_id: String,
    /// Whether the default (non-account) branch is tracked.
    pub track_default: bool,
    pub accounts: Vec<SafeAccount>,
    pub max_clean_address_count: u32,
    pub save_interval: Duration,
}

impl EngineConfig {
    pub fn new(network: Network, data_dir: PathBuf, wallet_id: impl Into<String>) -> Self {
        Self {
            network,
            data_dir,
            wallet_id: wallet_id.into(),
            track_default: true,
            accounts: Vec::new(),
            max_clean_address_count: DEFAULT_MAX_CLEAN_ADDRESS_COUNT,
            save_interval: DEFAULT_SAVE_INTERVAL,
        }
    }
}

pub struct WalletEngine {
    config: EngineConfig,
    keys: Arc<dyn KeySource>,
    source: Arc<dyn BlockSource>,
    primary: Arc<dyn BroadcastApi>,
    fallback: Arc<dyn FallbackApi>,
    fees: Arc<dyn FeeEstimator>,
    chain: Arc<RwLock<HeaderChain>>,
    tracker: Arc<RwLock<Tracker>>,
    persister: Persister,
    state: Arc<watch::Sender<WalletState>>,
    best_height: watch::Sender<Height>,
    peer_count: watch::Sender<usize>,
}

impl std::fmt::Debug for WalletEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WalletEngine {
    /// Build the engine, restoring the header chain and tracker from
    /// the working-data root when snapshots exist. `checkpoint` seeds
    /// the chain otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        config: EngineConfig,
        keys: Arc<dyn KeySource>,
        source: Arc<dyn BlockSource>,
        primary: Arc<dyn BroadcastApi>,
        fallback: Arc<dyn FallbackApi>,
        fees: Arc<dyn FeeEstimator>,
        checkpoint: HeaderChain,
    ) -> Result<Self, WalletError> {
        if keys.network() != bitcoin_network(config.network) {
            return Err(WalletError::Key(format!(
                "key network {} does not match wallet network {}",
                keys.network(),
                config.network
            )));
        }

        let chain_path = Persister::header_chain_path(&config.data_dir, config.network);
        let (chain, saved_chain_height) = match fs::read(&chain_path) {
            Ok(bytes) => {
                let chain = HeaderChain::from_bytes(&bytes)?;
                log::info!("restored header chain at height {}", chain.height());
                let height = chain.height();
                (chain, Some(height))
            }
            Err(_) => (checkpoint, None),
        };

        let tracker_dir = Persister::tracker_dir(&config.data_dir, &config.wallet_id);
        let (mut tracker, saved_tracker_height) = if tracker_dir.is_dir() {
            match Tracker::load(&tracker_dir) {
                Ok(tracker) => {
                    let saved = tracker.best_height().as_chain();
                    log::info!(
                        "restored tracker: {} scripts, {} transactions",
                        tracker.script_count(),
                        tracker.transaction_count()
                    );
                    (tracker, saved)
                }
                Err(e) => {
                    log::warn!("tracker snapshot unusable, starting fresh: {}", e);
                    (Tracker::new(), None)
                }
            }
        } else {
            (Tracker::new(), None)
        };

        update_tracking(
            &mut tracker,
            keys.as_ref(),
            config.track_default,
            &config.accounts,
            config.max_clean_address_count,
        )?;

        let best = best_height_of(&chain, &tracker);
        let chain = Arc::new(RwLock::new(chain));
        let tracker = Arc::new(RwLock::new(tracker));
        let persister = Persister::new(
            config.data_dir.clone(),
            config.network,
            config.wallet_id.clone(),
            chain.clone(),
            tracker.clone(),
            source.clone(),
            config.save_interval,
            saved_chain_height,
            saved_tracker_height,
        );

        let (state, _) = watch::channel(WalletState::NotStarted);
        let (best_height, _) = watch::channel(best);
        let (peer_count, _) = watch::channel(0);
        Ok(Self {
            config,
            keys,
            source,
            primary,
            fallback,
            fees,
            chain,
            tracker,
            persister,
            state: Arc::new(state),
            best_height,
            peer_count,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Run the engine until `cancel` fires: sync loop, block
    /// application, persistence scheduler and the tracking/notification
    /// task.
    pub async fn start(&self, cancel: CancellationToken) {
        self.set_state(WalletState::SyncingBlocks);
        // Subscribe before any task runs so no tracker change slips
        // past the notification loop.
        let changes = self.tracker.read().await.subscribe_changes();

        let sync = SyncLoop::new(
            self.chain.clone(),
            self.tracker.clone(),
            self.keys.clone(),
            self.source.clone(),
            self.state.clone(),
        );
        tokio::join!(
            sync.run(cancel.clone()),
            self.apply_blocks(cancel.clone()),
            self.persister.run(cancel.clone()),
            self.watch_tracker(changes, cancel.clone()),
        );

        self.set_state(WalletState::NotStarted);
        if let Err(e) = self.persister.save_all_changed().await {
            log::warn!("final save failed: {}", e);
        }
    }

    /// Apply buffered blocks handed over by the sync loop.
    async fn apply_blocks(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(BLOCK_APPLY_INTERVAL) => {}
            }
            self.tracker.write().await.drain_buffer();
        }
    }

    /// Re-run address tracking and push notifications whenever the
    /// tracker changes; poll the peer count on a timer.
    async fn watch_tracker(&self, mut changes: watch::Receiver<u64>, cancel: CancellationToken) {
        // Catch anything that happened between init and start.
        self.refresh_tracking().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.refresh_tracking().await;
                }
                _ = tokio::time::sleep(PEER_POLL_INTERVAL) => {
                    self.push_peer_count();
                }
            }
        }
    }

    async fn refresh_tracking(&self) {
        let mut tracker = self.tracker.write().await;
        if let Err(e) = update_tracking(
            &mut tracker,
            self.keys.as_ref(),
            self.config.track_default,
            &self.config.accounts,
            self.config.max_clean_address_count,
        ) {
            log::warn!("address tracking update failed: {}", e);
        }
        drop(tracker);
        self.push_best_height().await;
    }

    /// Feed one mempool transaction to the tracker. Returns true if it
    /// was relevant and new (or changed).
    pub async fn process_mempool_transaction(&self, tx: Transaction) -> bool {
        let mut tracker = self.tracker.write().await;
        tracker.process_transaction(SmartTransaction::new(tx, Height::MemPool))
    }

    // ── Notifications ────────────────────────────────────────────────────

    pub fn subscribe_state(&self) -> watch::Receiver<WalletState> {
        self.state.subscribe()
    }

    pub fn subscribe_best_height(&self) -> watch::Receiver<Height> {
        self.best_height.subscribe()
    }

    pub fn subscribe_peer_count(&self) -> watch::Receiver<usize> {
        self.peer_count.subscribe()
    }

    pub fn state(&self) -> WalletState {
        *self.state.borrow()
    }

    fn set_state(&self, next: WalletState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn push_best_height(&self) {
        let best = {
            let chain = self.chain.read().await;
            let tracker = self.tracker.read().await;
            best_height_of(&chain, &tracker)
        };
        self.best_height.send_if_modified(|current| {
            if *current == best {
                false
            } else {
                *current = best;
                true
            }
        });
    }

    fn push_peer_count(&self) {
        let count = self.source.connected_peers();
        self.peer_count.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
    }

    // ── Queries ──────────────────────────────────────────────────────────

    fn assert_account(&self, account: Option<&SafeAccount>) -> Result<(), WalletError> {
        match account {
            None if !self.config.track_default => Err(WalletError::InvalidAccount(
                "default branch is not tracked".to_string(),
            )),
            Some(acc) if !self.config.accounts.contains(acc) => {
                Err(WalletError::InvalidAccount(acc.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub async fn get_history(
        &self,
        account: Option<&SafeAccount>,
    ) -> Result<Vec<SafeHistoryRecord>, WalletError> {
        self.assert_account(account)?;
        let chain = self.chain.read().await;
        let tracker = self.tracker.read().await;
        history::get_history(&tracker, &chain, self.keys.as_ref(), account)
    }

    pub async fn get_unspent_coins(
        &self,
        account: Option<&SafeAccount>,
        allow_unconfirmed: bool,
    ) -> Result<Vec<Coin>, WalletError> {
        self.assert_account(account)?;
        let tracker = self.tracker.read().await;
        history::get_unspent_coins(&tracker, self.keys.as_ref(), account, allow_unconfirmed)
    }

    pub async fn get_balance(
        &self,
        account: Option<&SafeAccount>,
    ) -> Result<Balance, WalletError> {
        self.assert_account(account)?;
        let tracker = self.tracker.read().await;
        history::get_balance(&tracker, self.keys.as_ref(), account)
    }

    pub async fn build_transaction(
        &self,
        destination: ScriptBuf,
        amount: Amount,
        tier: FeeTier,
        account: Option<&SafeAccount>,
        allow_unconfirmed: bool,
    ) -> Result<BuiltTransaction, BuildError> {
        self.assert_account(account).map_err(BuildError::Wallet)?;
        let tracker = self.tracker.read().await;
        builder::build_transaction(
            &tracker,
            self.keys.as_ref(),
            self.fees.as_ref(),
            destination,
            amount,
            tier,
            account,
            allow_unconfirmed,
        )
        .await
    }

    pub async fn send_transaction(&self, tx: &Transaction) -> Result<Propagation, WalletError> {
        broadcast::send_transaction(self.primary.as_ref(), self.fallback.as_ref(), tx).await
    }

    /// On-demand flush of everything that changed.
    pub async fn save_all_changed(&self) -> Result<(), WalletError> {
        self.persister.save_all_changed().await
    }
}

/// Best tracked height, guarded against a header chain that has not
/// caught back up to the tracker after a cold start.
fn best_height_of(chain: &HeaderChain, tracker: &Tracker) -> Height {
    match tracker.best_height() {
        Height::Chain(best) if chain.height() < best => Height::Unknown,
        other => other,
    }
}
