//! Gap-limit address tracking.
//!
//! Keeps every account branch watched ahead of use: scripts are derived
//! in index order until a run of consecutive never-paid scripts longer
//! than the configured limit has been registered, so there is always a
//! fresh runway of clean addresses beyond the last used one.

use spv_types::{HdPathType, SafeAccount};

use crate::error::WalletError;
use crate::safe::KeySource;
use crate::tracker::Tracker;

/// Default number of consecutive clean addresses kept tracked ahead.
pub const DEFAULT_MAX_CLEAN_ADDRESS_COUNT: u32 = 20;

/// Walk one branch, registering scripts until `max_clean + 1`
/// consecutive clean ones are tracked past the last used address.
fn update_branch(
    tracker: &mut Tracker,
    keys: &dyn KeySource,
    account: Option<&SafeAccount>,
    path: HdPathType,
    max_clean: u32,
) -> Result<(), WalletError> {
    let mut clean = 0u32;
    let mut index = 0u32;
    loop {
        let script = keys.script_pubkey(index, path, account)?;
        tracker.track_script(script.clone());
        if tracker.is_clean(&script) {
            clean += 1;
            if clean > max_clean {
                return Ok(());
            }
        } else {
            clean = 0;
        }
        index += 1;
    }
}

/// Bring the tracked script set up to date for every watched branch.
///
/// Must be re-run whenever the tracker's transaction set changes, since
/// a new payment can consume part of the clean runway.
pub fn update_tracking(
    tracker: &mut Tracker,
    keys: &dyn KeySource,
    track_default: bool,
    accounts: &[SafeAccount],
    max_clean: u32,
) -> Result<(), WalletError> {
    for path in HdPathType::ALL {
        if track_default {
            update_branch(tracker, keys, None, path, max_clean)?;
        }
        for account in accounts {
            update_branch(tracker, keys, Some(account), path, max_clean)?;
        }
    }
    Ok(())
}
