//! History and UTXO reconstruction.
//!
//! Pure functions over tracker state plus the account's derived
//! scripts: wallet history with per-transaction net amounts, the
//! unspent coin set, and confirmed/unconfirmed balances.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::{Amount, OutPoint, ScriptBuf, SignedAmount, Txid};
use spv_types::{HdPathType, Height, SafeAccount};

use crate::chain::HeaderChain;
use crate::error::WalletError;
use crate::safe::KeySource;
use crate::tracker::Tracker;

/// A spendable output of a tracked transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
    pub confirmed: bool,
}

/// One wallet-relevant transaction, net of watched inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeHistoryRecord {
    pub txid: Txid,
    pub height: Height,
    /// Block time for confirmed transactions, retrieval instant
    /// otherwise. Unix seconds.
    pub timestamp: u64,
    pub amount: SignedAmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub confirmed: Amount,
    pub unconfirmed: Amount,
}

impl Default for Balance {
    fn default() -> Self {
        Self {
            confirmed: Amount::ZERO,
            unconfirmed: Amount::ZERO,
        }
    }
}

impl Balance {
    /// Spendable total under the given unconfirmed policy.
    pub fn available(&self, allow_unconfirmed: bool) -> Amount {
        if allow_unconfirmed {
            self.confirmed + self.unconfirmed
        } else {
            self.confirmed
        }
    }
}

/// The tracked scripts belonging to one account (or the default
/// branch), recovered by re-deriving over the tracked window.
pub fn account_scripts(
    tracker: &Tracker,
    keys: &dyn KeySource,
    account: Option<&SafeAccount>,
) -> Result<HashSet<ScriptBuf>, WalletError> {
    let window = tracker.script_count() as u32;
    let mut scripts = HashSet::new();
    for path in HdPathType::ALL {
        for index in 0..window {
            let script = keys.script_pubkey(index, path, account)?;
            if tracker.is_tracked(&script) {
                scripts.insert(script);
            }
        }
    }
    Ok(scripts)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wallet history for the account, one deduplicated record per
/// relevant transaction, ascending by timestamp.
///
/// The net amount counts value received to watched scripts minus value
/// spent from them; a spent output only counts when its funding
/// transaction is itself tracked, since an output cannot be partially
/// spent.
pub fn get_history(
    tracker: &Tracker,
    chain: &HeaderChain,
    keys: &dyn KeySource,
    account: Option<&SafeAccount>,
) -> Result<Vec<SafeHistoryRecord>, WalletError> {
    let scripts = account_scripts(tracker, keys, account)?;
    let now = unix_now();

    let mut records: HashMap<Txid, SafeHistoryRecord> = HashMap::new();
    for stx in tracker.transactions() {
        let mut net: i64 = 0;
        let mut touches = false;

        for out in &stx.transaction.output {
            if scripts.contains(&out.script_pubkey) {
                net += out.value.to_sat() as i64;
                touches = true;
            }
        }
        for input in &stx.transaction.input {
            let prev = input.previous_output;
            if let Some(funding) = tracker.get(&prev.txid) {
                if let Some(out) = funding.transaction.output.get(prev.vout as usize) {
                    if scripts.contains(&out.script_pubkey) {
                        net -= out.value.to_sat() as i64;
                        touches = true;
                    }
                }
            }
        }
        if !touches {
            continue;
        }

        let timestamp = stx
            .height
            .as_chain()
            .and_then(|h| chain.time_at(h))
            .unwrap_or(now);
        records.insert(
            stx.txid(),
            SafeHistoryRecord {
                txid: stx.txid(),
                height: stx.height,
                timestamp,
                amount: SignedAmount::from_sat(net),
            },
        );
    }

    let mut history: Vec<SafeHistoryRecord> = records.into_values().collect();
    history.sort_by(|a, b| (a.timestamp, a.txid).cmp(&(b.timestamp, b.txid)));
    Ok(history)
}

/// Unspent outputs of tracked transactions paying the account.
///
/// A coin spent by any tracked confirmed-or-mempool transaction is
/// excluded regardless of the unconfirmed policy.
pub fn get_unspent_coins(
    tracker: &Tracker,
    keys: &dyn KeySource,
    account: Option<&SafeAccount>,
    allow_unconfirmed: bool,
) -> Result<Vec<Coin>, WalletError> {
    let scripts = account_scripts(tracker, keys, account)?;

    let mut spent: HashSet<OutPoint> = HashSet::new();
    for stx in tracker.transactions() {
        if stx.height == Height::Unknown {
            continue;
        }
        for input in &stx.transaction.input {
            spent.insert(input.previous_output);
        }
    }

    let mut coins = Vec::new();
    for stx in tracker.transactions() {
        if stx.height == Height::Unknown {
            continue;
        }
        if !allow_unconfirmed && !stx.confirmed() {
            continue;
        }
        let txid = stx.txid();
        for (vout, out) in stx.transaction.output.iter().enumerate() {
            if !scripts.contains(&out.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint {
                txid,
                vout: vout as u32,
            };
            if spent.contains(&outpoint) {
                continue;
            }
            coins.push(Coin {
                outpoint,
                script_pubkey: out.script_pubkey.clone(),
                amount: out.value,
                confirmed: stx.confirmed(),
            });
        }
    }
    Ok(coins)
}

/// Confirmed and unconfirmed balance of the account.
pub fn get_balance(
    tracker: &Tracker,
    keys: &dyn KeySource,
    account: Option<&SafeAccount>,
) -> Result<Balance, WalletError> {
    let mut balance = Balance::default();
    for coin in get_unspent_coins(tracker, keys, account, true)? {
        if coin.confirmed {
            balance.confirmed += coin.amount;
        } else {
            balance.unconfirmed += coin.amount;
        }
    }
    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testutil::base_header;
    use crate::safe::Safe;
    use crate::tracker::testutil::{block, coinbase_like, script, spend};
    use crate::tracker::SmartTransaction;
    use crate::tracking::update_tracking;

    fn fixture() -> (Safe, Tracker, HeaderChain) {
        let safe = Safe::from_seed(&[11u8; 32], bitcoin::Network::Regtest, 1_500_000_000).unwrap();
        let mut tracker = Tracker::new();
        update_tracking(&mut tracker, &safe, true, &[], 5).unwrap();
        let chain = HeaderChain::new(base_header(1_500_100_000), 0);
        (safe, tracker, chain)
    }

    #[test]
    fn test_history_net_amounts() {
        let (safe, mut tracker, chain) = fixture();
        let receive = safe.script_pubkey(0, HdPathType::Receive, None).unwrap();
        let change = safe.script_pubkey(0, HdPathType::Change, None).unwrap();

        // Receive 50 000 sats at block 0.
        let funding = coinbase_like(receive, 50_000);
        let funding_txid = funding.compute_txid();
        tracker.add_or_replace_block(0, block(1_500_100_000, vec![funding]));
        tracker.drain_buffer();

        // Spend it: 30 000 to a foreign script, 15 000 back as change.
        let spending = spend(
            OutPoint {
                txid: funding_txid,
                vout: 0,
            },
            vec![(script(9), 30_000), (change, 15_000)],
        );
        tracker.process_transaction(SmartTransaction::new(spending, Height::MemPool));

        let history = get_history(&tracker, &chain, &safe, None).unwrap();
        assert_eq!(history.len(), 2);
        // Confirmed funding sorts first (block time precedes now).
        assert_eq!(history[0].amount, SignedAmount::from_sat(50_000));
        assert_eq!(history[0].timestamp, 1_500_100_000);
        assert_eq!(history[1].amount, SignedAmount::from_sat(15_000 - 50_000));
    }

    #[test]
    fn test_unspent_excludes_mempool_spends() {
        let (safe, mut tracker, _) = fixture();
        let receive = safe.script_pubkey(0, HdPathType::Receive, None).unwrap();

        let funding = coinbase_like(receive, 50_000);
        let funding_txid = funding.compute_txid();
        tracker.add_or_replace_block(0, block(1_500_100_000, vec![funding]));
        tracker.drain_buffer();

        // A mempool spend makes the confirmed coin unavailable even
        // when unconfirmed coins are excluded.
        let spending = spend(
            OutPoint {
                txid: funding_txid,
                vout: 0,
            },
            vec![(script(9), 49_000)],
        );
        tracker.process_transaction(SmartTransaction::new(spending, Height::MemPool));

        let coins = get_unspent_coins(&tracker, &safe, None, false).unwrap();
        assert!(coins.is_empty());
    }

    #[test]
    fn test_unconfirmed_policy_filters_coins() {
        let (safe, mut tracker, _) = fixture();
        let receive = safe.script_pubkey(0, HdPathType::Receive, None).unwrap();
        let pending = coinbase_like(receive, 20_000);
        tracker.process_transaction(SmartTransaction::new(pending, Height::MemPool));

        assert!(get_unspent_coins(&tracker, &safe, None, false)
            .unwrap()
            .is_empty());
        let coins = get_unspent_coins(&tracker, &safe, None, true).unwrap();
        assert_eq!(coins.len(), 1);
        assert!(!coins[0].confirmed);
    }

    #[test]
    fn test_balance_splits_by_confirmation() {
        let (safe, mut tracker, _) = fixture();
        let receive0 = safe.script_pubkey(0, HdPathType::Receive, None).unwrap();
        let receive1 = safe.script_pubkey(1, HdPathType::Receive, None).unwrap();

        tracker.add_or_replace_block(0, block(1_500_100_000, vec![coinbase_like(receive0, 70_000)]));
        tracker.drain_buffer();
        tracker.process_transaction(SmartTransaction::new(
            coinbase_like(receive1, 5_000),
            Height::MemPool,
        ));

        let balance = get_balance(&tracker, &safe, None).unwrap();
        assert_eq!(balance.confirmed, Amount::from_sat(70_000));
        assert_eq!(balance.unconfirmed, Amount::from_sat(5_000));
        assert_eq!(balance.available(false), Amount::from_sat(70_000));
        assert_eq!(balance.available(true), Amount::from_sat(75_000));
    }

    #[test]
    fn test_accounts_do_not_see_default_branch_coins() {
        let (safe, mut tracker, _) = fixture();
        let account = SafeAccount::new(0);
        update_tracking(&mut tracker, &safe, true, &[account], 5).unwrap();

        let receive = safe.script_pubkey(0, HdPathType::Receive, None).unwrap();
        tracker.add_or_replace_block(0, block(1_500_100_000, vec![coinbase_like(receive, 10_000)]));
        tracker.drain_buffer();

        assert!(get_unspent_coins(&tracker, &safe, Some(&account), true)
            .unwrap()
            .is_empty());
        assert_eq!(
            get_unspent_coins(&tracker, &safe, None, true).unwrap().len(),
            1
        );
    }
}
