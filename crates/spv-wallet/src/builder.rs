//! Coin selection and transaction building.
//!
//! Builds a signed P2WPKH transaction from the wallet's unspent coins:
//! clean change script, fee quote, greedy descending coin selection
//! (confirmed before unconfirmed), per-input key resolution, signing
//! and a final self-verification pass.

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use spv_types::{FeeTier, HdPathType, SafeAccount};
use spv_rpc::{FeeClient, RpcError};

use crate::error::{BuildError, WalletError};
use crate::history::{get_balance, get_unspent_coins, Coin};
use crate::safe::KeySource;
use crate::tracker::Tracker;

// Linear size model: per-input, per-output and fixed overhead bytes,
// plus one byte per input for signature-length variance.
const BYTES_PER_INPUT: u64 = 148;
const BYTES_PER_OUTPUT: u64 = 34;
const OVERHEAD_BYTES: u64 = 10;

/// Smallest realistic transaction: one input, two outputs.
const EXPECTED_MIN_TX_SIZE: u64 =
    BYTES_PER_INPUT + 2 * BYTES_PER_OUTPUT + OVERHEAD_BYTES - 1;

fn estimated_size(inputs: u64, outputs: u64) -> u64 {
    inputs * BYTES_PER_INPUT + outputs * BYTES_PER_OUTPUT + OVERHEAD_BYTES + inputs
}

/// Per-byte fee quote for a tier.
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn sat_per_byte(&self, tier: FeeTier) -> Result<u64, RpcError>;
}

#[async_trait]
impl FeeEstimator for FeeClient {
    async fn sat_per_byte(&self, tier: FeeTier) -> Result<u64, RpcError> {
        FeeClient::sat_per_byte(self, tier).await
    }
}

#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub transaction: Transaction,
    pub fee: Amount,
    /// Fee as a percentage of the sent amount, informational.
    pub fee_percent: f64,
    pub spends_unconfirmed: bool,
}

/// Greedy selection: confirmed coins in descending amount order, then
/// unconfirmed ones, until the running total reaches `target`.
fn select_coins(coins: &[Coin], target: Amount) -> Result<Vec<Coin>, BuildError> {
    let mut confirmed: Vec<&Coin> = coins.iter().filter(|c| c.confirmed).collect();
    let mut unconfirmed: Vec<&Coin> = coins.iter().filter(|c| !c.confirmed).collect();
    confirmed.sort_by(|a, b| b.amount.cmp(&a.amount));
    unconfirmed.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for coin in confirmed.into_iter().chain(unconfirmed) {
        if total >= target {
            break;
        }
        total += coin.amount;
        selected.push(coin.clone());
    }
    if total < target {
        return Err(BuildError::InsufficientFunds {
            need: target,
            available: total,
        });
    }
    Ok(selected)
}

/// Build, sign and verify a transaction paying `amount` to
/// `destination`.
///
/// A zero `amount` means spend everything available. Change goes to
/// the first clean script of the account's change path; a zero change
/// output is omitted.
pub async fn build_transaction(
    tracker: &Tracker,
    keys: &dyn KeySource,
    fees: &dyn FeeEstimator,
    destination: ScriptBuf,
    amount: Amount,
    tier: FeeTier,
    account: Option<&SafeAccount>,
    allow_unconfirmed: bool,
) -> Result<BuiltTransaction, BuildError> {
    let change_script = clean_change_script(tracker, keys, account)?;
    let balance = get_balance(tracker, keys, account)?;
    let available = balance.available(allow_unconfirmed);

    let rate = fees
        .sat_per_byte(tier)
        .await
        .map_err(|e| BuildError::FeeQuery(e.to_string()))?;

    let coins = get_unspent_coins(tracker, keys, account, allow_unconfirmed)?;
    let spend_all = amount == Amount::ZERO;

    let (selected, fee) = if spend_all {
        let fee = Amount::from_sat(rate * estimated_size(coins.len() as u64, 2));
        (select_coins(&coins, available)?, fee)
    } else {
        // Trial selection with the minimal-size fee fixes the input
        // count, which fixes the real fee.
        let min_fee = Amount::from_sat(rate * EXPECTED_MIN_TX_SIZE);
        let trial = select_coins(&coins, amount + min_fee)?;
        let fee = Amount::from_sat(rate * estimated_size(trial.len() as u64, 2));
        (select_coins(&coins, amount + fee)?, fee)
    };

    let send = if spend_all {
        available
            .checked_sub(fee)
            .ok_or(BuildError::InsufficientFunds {
                need: fee,
                available,
            })?
    } else {
        amount
    };
    if available < send + fee {
        return Err(BuildError::InsufficientFunds {
            need: send + fee,
            available,
        });
    }

    // Spending everything when the funds just cover the fee leaves a
    // zero send amount; the percentage is meaningless then.
    let fee_percent = if send == Amount::ZERO {
        0.0
    } else {
        fee.to_sat() as f64 * 100.0 / send.to_sat() as f64
    };
    let spends_unconfirmed = allow_unconfirmed && balance.confirmed < send + fee;
    log::debug!(
        "building transaction: send={} fee={} ({:.2}% of sent) inputs={}",
        send,
        fee,
        fee_percent,
        selected.len()
    );

    let transaction = sign(tracker, keys, account, &selected, &destination, send, change_script, fee)?;
    verify(&transaction, &selected, fee)?;

    Ok(BuiltTransaction {
        transaction,
        fee,
        fee_percent,
        spends_unconfirmed,
    })
}

/// First never-paid script on the account's change path.
fn clean_change_script(
    tracker: &Tracker,
    keys: &dyn KeySource,
    account: Option<&SafeAccount>,
) -> Result<ScriptBuf, BuildError> {
    for index in 0..=tracker.script_count() as u32 {
        let script = keys.script_pubkey(index, HdPathType::Change, account)?;
        if tracker.is_clean(&script) {
            return Ok(script);
        }
    }
    Err(BuildError::Wallet(WalletError::Other(
        "no clean change script available".to_string(),
    )))
}

#[allow(clippy::too_many_arguments)]
fn sign(
    tracker: &Tracker,
    keys: &dyn KeySource,
    account: Option<&SafeAccount>,
    selected: &[Coin],
    destination: &ScriptBuf,
    send: Amount,
    change_script: ScriptBuf,
    fee: Amount,
) -> Result<Transaction, BuildError> {
    let total: Amount = Amount::from_sat(selected.iter().map(|c| c.amount.to_sat()).sum());
    let change = total
        .checked_sub(send + fee)
        .ok_or(BuildError::InsufficientFunds {
            need: send + fee,
            available: total,
        })?;

    let mut output = vec![TxOut {
        value: send,
        script_pubkey: destination.clone(),
    }];
    if change > Amount::ZERO {
        output.push(TxOut {
            value: change,
            script_pubkey: change_script,
        });
    }

    let mut transaction = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: selected
            .iter()
            .map(|coin| TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output,
    };

    let secp: Secp256k1<All> = Secp256k1::new();
    let window = tracker.script_count() as u32;
    let mut witnesses = Vec::with_capacity(selected.len());
    {
        let mut cache = SighashCache::new(&transaction);
        for (i, coin) in selected.iter().enumerate() {
            let key = keys
                .find_private_key(&coin.script_pubkey, window, account)
                .map_err(|e| BuildError::Signing(e.to_string()))?;
            let pubkey = CompressedPublicKey::from_private_key(&secp, &key)
                .map_err(|e| BuildError::Signing(e.to_string()))?;
            let sighash = cache
                .p2wpkh_signature_hash(i, &coin.script_pubkey, coin.amount, EcdsaSighashType::All)
                .map_err(|e| BuildError::Signing(e.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, &key.inner),
                sighash_type: EcdsaSighashType::All,
            };
            witnesses.push(Witness::p2wpkh(&signature, &pubkey.0));
        }
    }
    for (input, witness) in transaction.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }
    Ok(transaction)
}

/// Re-check signatures, scripts and amounts of the finished
/// transaction.
fn verify(transaction: &Transaction, selected: &[Coin], fee: Amount) -> Result<(), BuildError> {
    let inputs: u64 = selected.iter().map(|c| c.amount.to_sat()).sum();
    let outputs: u64 = transaction.output.iter().map(|o| o.value.to_sat()).sum();
    if inputs != outputs + fee.to_sat() {
        return Err(BuildError::Verification);
    }

    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(transaction);
    for (i, coin) in selected.iter().enumerate() {
        let witness = &transaction.input[i].witness;
        let (Some(sig_bytes), Some(pk_bytes)) = (witness.nth(0), witness.nth(1)) else {
            return Err(BuildError::Verification);
        };
        let signature =
            bitcoin::ecdsa::Signature::from_slice(sig_bytes).map_err(|_| BuildError::Verification)?;
        let pubkey = CompressedPublicKey::from_slice(pk_bytes)
            .map_err(|_| BuildError::Verification)?;
        if ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()) != coin.script_pubkey {
            return Err(BuildError::Verification);
        }
        let sighash = cache
            .p2wpkh_signature_hash(i, &coin.script_pubkey, coin.amount, signature.sighash_type)
            .map_err(|_| BuildError::Verification)?;
        let message = Message::from_digest(sighash.to_byte_array());
        secp.verify_ecdsa(&message, &signature.signature, &pubkey.0)
            .map_err(|_| BuildError::Verification)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe::Safe;
    use crate::tracker::testutil::{block, coinbase_like, script};
    use crate::tracker::SmartTransaction;
    use crate::tracking::update_tracking;
    use spv_types::Height;

    struct FixedRate(u64);

    #[async_trait]
    impl FeeEstimator for FixedRate {
        async fn sat_per_byte(&self, _tier: FeeTier) -> Result<u64, RpcError> {
            Ok(self.0)
        }
    }

    struct FailingFees;

    #[async_trait]
    impl FeeEstimator for FailingFees {
        async fn sat_per_byte(&self, _tier: FeeTier) -> Result<u64, RpcError> {
            Err(RpcError::Status(503))
        }
    }

    fn coin(sats: u64, confirmed: bool, tag: u8) -> Coin {
        Coin {
            outpoint: bitcoin::OutPoint {
                txid: coinbase_like(script(tag), sats).compute_txid(),
                vout: 0,
            },
            script_pubkey: script(tag),
            amount: Amount::from_sat(sats),
            confirmed,
        }
    }

    #[test]
    fn test_selection_prefers_large_confirmed_coins() {
        let coins = vec![
            coin(10_000, true, 1),
            coin(50_000, true, 2),
            coin(90_000, false, 3),
            coin(30_000, true, 4),
        ];
        let selected = select_coins(&coins, Amount::from_sat(60_000)).unwrap();
        let amounts: Vec<u64> = selected.iter().map(|c| c.amount.to_sat()).collect();
        assert_eq!(amounts, vec![50_000, 30_000]);
    }

    #[test]
    fn test_selection_falls_through_to_unconfirmed() {
        let coins = vec![coin(20_000, true, 1), coin(90_000, false, 2)];
        let selected = select_coins(&coins, Amount::from_sat(50_000)).unwrap();
        let amounts: Vec<u64> = selected.iter().map(|c| c.amount.to_sat()).collect();
        assert_eq!(amounts, vec![20_000, 90_000]);
    }

    #[test]
    fn test_selection_reports_shortfall() {
        let coins = vec![coin(20_000, true, 1)];
        let err = select_coins(&coins, Amount::from_sat(50_000)).unwrap_err();
        assert!(err.is_insufficient_funds());
    }

    /// Safe plus a tracker holding one confirmed coin of `sats`.
    fn funded_wallet(sats: u64) -> (Safe, Tracker) {
        let safe = Safe::from_seed(&[5u8; 32], bitcoin::Network::Regtest, 1_500_000_000).unwrap();
        let mut tracker = Tracker::new();
        update_tracking(&mut tracker, &safe, true, &[], 5).unwrap();
        let receive = safe.script_pubkey(0, HdPathType::Receive, None).unwrap();
        tracker.add_or_replace_block(0, block(1_500_100_000, vec![coinbase_like(receive, sats)]));
        tracker.drain_buffer();
        (safe, tracker)
    }

    #[tokio::test]
    async fn test_spend_all_sends_available_minus_fee() {
        let (safe, tracker) = funded_wallet(100_000_000);
        let built = build_transaction(
            &tracker,
            &safe,
            &FixedRate(1),
            script(99),
            Amount::ZERO,
            FeeTier::Medium,
            None,
            false,
        )
        .await
        .unwrap();

        // One input, two modeled outputs at one sat per byte.
        assert_eq!(built.fee, Amount::from_sat(estimated_size(1, 2)));
        assert_eq!(built.transaction.output.len(), 1);
        assert_eq!(
            built.transaction.output[0].value,
            Amount::from_sat(100_000_000) - built.fee
        );
        assert!(!built.spends_unconfirmed);
    }

    #[tokio::test]
    async fn test_spend_all_covering_only_the_fee_builds() {
        // The single coin covers exactly the fee: the destination
        // output is allowed to carry zero value.
        let (safe, tracker) = funded_wallet(estimated_size(1, 2));
        let built = build_transaction(
            &tracker,
            &safe,
            &FixedRate(1),
            script(99),
            Amount::ZERO,
            FeeTier::Medium,
            None,
            false,
        )
        .await
        .unwrap();

        assert_eq!(built.transaction.output.len(), 1);
        assert_eq!(built.transaction.output[0].value, Amount::ZERO);
        assert_eq!(built.fee, Amount::from_sat(estimated_size(1, 2)));
        assert_eq!(built.fee_percent, 0.0);
    }

    #[tokio::test]
    async fn test_exact_amount_gets_change_output() {
        let (safe, tracker) = funded_wallet(100_000_000);
        let built = build_transaction(
            &tracker,
            &safe,
            &FixedRate(2),
            script(99),
            Amount::from_sat(40_000_000),
            FeeTier::High,
            None,
            false,
        )
        .await
        .unwrap();

        assert_eq!(built.transaction.output.len(), 2);
        assert_eq!(built.transaction.output[0].value, Amount::from_sat(40_000_000));
        assert_eq!(
            built.transaction.output[1].value,
            Amount::from_sat(60_000_000) - built.fee
        );
        // Change pays the wallet's own change path.
        let change = safe.script_pubkey(0, HdPathType::Change, None).unwrap();
        assert_eq!(built.transaction.output[1].script_pubkey, change);
        // Every input carries a two-element P2WPKH witness.
        assert!(built
            .transaction
            .input
            .iter()
            .all(|i| i.witness.len() == 2));
    }

    #[tokio::test]
    async fn test_amount_beyond_available_fails_without_transaction() {
        let (safe, tracker) = funded_wallet(50_000);
        let err = build_transaction(
            &tracker,
            &safe,
            &FixedRate(1),
            script(99),
            Amount::from_sat(49_990),
            FeeTier::Low,
            None,
            false,
        )
        .await
        .unwrap_err();
        assert!(err.is_insufficient_funds());
    }

    #[tokio::test]
    async fn test_fee_query_failure_aborts_build() {
        let (safe, tracker) = funded_wallet(100_000_000);
        let err = build_transaction(
            &tracker,
            &safe,
            &FailingFees,
            script(99),
            Amount::from_sat(1_000_000),
            FeeTier::Medium,
            None,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::FeeQuery(_)));
    }

    #[tokio::test]
    async fn test_unconfirmed_spend_is_flagged() {
        let (safe, mut tracker) = funded_wallet(30_000);
        let receive = safe.script_pubkey(1, HdPathType::Receive, None).unwrap();
        tracker.process_transaction(SmartTransaction::new(
            coinbase_like(receive, 80_000),
            Height::MemPool,
        ));

        let built = build_transaction(
            &tracker,
            &safe,
            &FixedRate(1),
            script(99),
            Amount::from_sat(60_000),
            FeeTier::Medium,
            None,
            true,
        )
        .await
        .unwrap();
        assert!(built.spends_unconfirmed);
    }
}
