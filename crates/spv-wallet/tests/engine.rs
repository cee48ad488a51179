//! End-to-end engine tests against mock collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Witness,
};
use spv_rpc::{PushTxResponse, RpcError};
use spv_types::{FeeTier, HdPathType, Height, Network, SafeAccount, WalletState};
use spv_wallet::engine::{EngineConfig, WalletEngine};
use spv_wallet::{
    BlockSource, BroadcastApi, BroadcastResponse, FallbackApi, FeeEstimator, HeaderChain,
    KeySource, Propagation, Safe, WalletError,
};
use tokio_util::sync::CancellationToken;

const BASE_TIME: u32 = 1_483_228_800;

fn header(prev: BlockHash, time: u32, nonce: u32) -> Header {
    Header {
        version: BlockVersion::TWO,
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce,
    }
}

/// Header chain at heights 0..times.len() with the given block times.
fn chain_with_times(times: &[u32]) -> HeaderChain {
    let mut chain = HeaderChain::new(header(BlockHash::all_zeros(), times[0], 0), 0);
    for (i, t) in times.iter().enumerate().skip(1) {
        chain.append(header(chain.tip_hash(), *t, i as u32)).unwrap();
    }
    chain
}

fn pay_to(script_pubkey: ScriptBuf, sats: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey,
        }],
    }
}

struct ScriptedSource {
    responses: Mutex<HashMap<u32, Option<Block>>>,
}

#[async_trait]
impl BlockSource for ScriptedSource {
    async fn next_block(
        &self,
        height: u32,
        _hash: BlockHash,
        cancel: &CancellationToken,
    ) -> Result<Option<Block>, WalletError> {
        let response = self.responses.lock().unwrap().get(&height).cloned();
        match response {
            Some(r) => Ok(r),
            None => {
                cancel.cancelled().await;
                Err(WalletError::Fetch("cancelled".into()))
            }
        }
    }

    async fn purge(&self, _reason: &str) {}

    fn connected_peers(&self) -> usize {
        3
    }

    fn peer_cache(&self) -> Vec<u8> {
        vec![0xca, 0xfe]
    }
}

struct AcceptingPrimary {
    broadcasts: AtomicU32,
}

#[async_trait]
impl BroadcastApi for AcceptingPrimary {
    async fn broadcast(&self, _tx: &Transaction) -> Result<BroadcastResponse, RpcError> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        Ok(BroadcastResponse::default())
    }

    async fn transaction_present(&self, _txid: &bitcoin::Txid) -> Result<bool, RpcError> {
        Ok(self.broadcasts.load(Ordering::SeqCst) >= 1)
    }
}

struct NeverFallback;

#[async_trait]
impl FallbackApi for NeverFallback {
    async fn push(&self, _tx_hex: &str) -> Result<PushTxResponse, RpcError> {
        panic!("fallback must not be used");
    }
}

struct FixedRate(u64);

#[async_trait]
impl FeeEstimator for FixedRate {
    async fn sat_per_byte(&self, _tier: FeeTier) -> Result<u64, RpcError> {
        Ok(self.0)
    }
}

struct Fixture {
    engine: Arc<WalletEngine>,
    safe: Arc<Safe>,
    _dir: tempfile::TempDir,
}

/// Engine over a 4-block chain where block 2 pays the wallet
/// `funded_sats` on its first receive address.
fn fixture(funded_sats: u64) -> Fixture {
    let times: Vec<u32> = (0..4).map(|i| BASE_TIME + i * 600).collect();
    let chain = chain_with_times(&times);
    // Wallet created at the block-1 timestamp.
    let safe = Arc::new(
        Safe::from_seed(&[42u8; 32], bitcoin::Network::Testnet, u64::from(times[1])).unwrap(),
    );
    let receive = safe.script_pubkey(0, HdPathType::Receive, None).unwrap();

    let mut responses = HashMap::new();
    for height in 1..=3u32 {
        let txdata = if height == 2 {
            vec![pay_to(receive.clone(), funded_sats)]
        } else {
            vec![]
        };
        responses.insert(
            height,
            Some(Block {
                header: *chain.header_at(height).unwrap(),
                txdata,
            }),
        );
    }

    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new(Network::Test, dir.path().to_path_buf(), "wallet1");
    let engine = WalletEngine::init(
        config,
        safe.clone(),
        Arc::new(ScriptedSource {
            responses: Mutex::new(responses),
        }),
        Arc::new(AcceptingPrimary {
            broadcasts: AtomicU32::new(0),
        }),
        Arc::new(NeverFallback),
        Arc::new(FixedRate(2)),
        chain,
    )
    .unwrap();
    Fixture {
        engine: Arc::new(engine),
        safe,
        _dir: dir,
    }
}

#[tokio::test(start_paused = true)]
async fn test_sync_to_tip_updates_state_balance_and_files() {
    let fx = fixture(50_000);
    let engine = fx.engine.clone();
    let mut state_rx = engine.subscribe_state();
    let mut height_rx = engine.subscribe_best_height();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.start(cancel).await }
    });

    state_rx
        .wait_for(|s| *s == WalletState::Synced)
        .await
        .unwrap();
    height_rx
        .wait_for(|h| *h == Height::Chain(3))
        .await
        .unwrap();

    let balance = engine.get_balance(None).await.unwrap();
    assert_eq!(balance.confirmed, Amount::from_sat(50_000));
    assert_eq!(balance.unconfirmed, Amount::ZERO);

    let history = engine.get_history(None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].height, Height::Chain(2));
    assert_eq!(history[0].timestamp, u64::from(BASE_TIME + 2 * 600));

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(engine.state(), WalletState::NotStarted);

    // Final save left the full on-disk layout behind.
    let dir = fx._dir.path();
    assert!(dir.join("peers-test.dat").exists());
    assert!(dir.join("headerchain-test.dat").exists());
    assert!(dir.join("wallet1").is_dir());
}

#[tokio::test(start_paused = true)]
async fn test_peer_count_notification_fires() {
    let fx = fixture(10_000);
    let engine = fx.engine.clone();
    let mut peers_rx = engine.subscribe_peer_count();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.start(cancel).await }
    });

    peers_rx.wait_for(|p| *p == 3).await.unwrap();

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_mempool_feed_extends_tracking_window() {
    let fx = fixture(0);
    let engine = fx.engine;

    let receive = fx.safe.script_pubkey(0, HdPathType::Receive, None).unwrap();
    assert!(engine.process_mempool_transaction(pay_to(receive, 25_000)).await);

    let balance = engine.get_balance(None).await.unwrap();
    assert_eq!(balance.unconfirmed, Amount::from_sat(25_000));

    // An unrelated transaction is not relevant.
    let foreign = ScriptBuf::from_bytes(vec![0x6a, 0x01, 0xff]);
    assert!(!engine.process_mempool_transaction(pay_to(foreign, 1)).await);
}

#[tokio::test]
async fn test_build_and_send_via_primary() {
    let fx = fixture(0);
    let engine = fx.engine;

    let receive = fx.safe.script_pubkey(0, HdPathType::Receive, None).unwrap();
    engine.process_mempool_transaction(pay_to(receive, 1_000_000)).await;

    let destination = ScriptBuf::from_bytes(vec![0x00, 0x14, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7]);
    let built = engine
        .build_transaction(
            destination,
            Amount::from_sat(400_000),
            FeeTier::Medium,
            None,
            true,
        )
        .await
        .unwrap();
    assert!(built.spends_unconfirmed);
    assert!(built.fee > Amount::ZERO);

    let outcome = engine.send_transaction(&built.transaction).await.unwrap();
    assert_eq!(outcome, Propagation::Primary);
}

#[test]
fn test_key_network_mismatch_is_rejected_at_init() {
    let times: Vec<u32> = (0..2).map(|i| BASE_TIME + i * 600).collect();
    let chain = chain_with_times(&times);
    // Regtest keys against a testnet engine configuration.
    let safe = Arc::new(
        Safe::from_seed(&[42u8; 32], bitcoin::Network::Regtest, u64::from(times[1])).unwrap(),
    );
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new(Network::Test, dir.path().to_path_buf(), "wallet1");
    let err = WalletEngine::init(
        config,
        safe,
        Arc::new(ScriptedSource {
            responses: Mutex::new(HashMap::new()),
        }),
        Arc::new(AcceptingPrimary {
            broadcasts: AtomicU32::new(0),
        }),
        Arc::new(NeverFallback),
        Arc::new(FixedRate(2)),
        chain,
    )
    .unwrap_err();
    assert!(matches!(err, WalletError::Key(_)));
}

#[tokio::test]
async fn test_unknown_account_is_rejected() {
    let fx = fixture(0);
    let stranger = SafeAccount::new(9);
    let err = fx.engine.get_balance(Some(&stranger)).await.unwrap_err();
    assert!(matches!(err, WalletError::InvalidAccount(_)));
}
