//! Wallet lifecycle state and fee tiers.

use serde::{Deserialize, Serialize};

/// Lifecycle of the wallet engine.
///
/// `NotStarted → SyncingBlocks` on start, `SyncingBlocks → Synced` when
/// the tracked height catches the header-chain height, and back to
/// `NotStarted` on clean shutdown. Notifications fire only when the
/// value actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletState {
    NotStarted,
    SyncingBlocks,
    Synced,
}

/// Confirmation-urgency tier used when quoting fee rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeeTier {
    Low,
    Medium,
    High,
}
