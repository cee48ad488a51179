//! Transaction tracker.
//!
//! Holds the append-only set of watched scripts and every transaction
//! relevant to them, keyed by txid with its current [`Height`]. Blocks
//! are applied through a bounded unprocessed buffer; each application
//! records the prior state of every touched transaction so a one-block
//! reorg restores the tracker exactly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{Block, BlockHash, Script, ScriptBuf, Transaction, Txid};
use spv_types::Height;
use tokio::sync::watch;

use crate::error::WalletError;

/// Maximum number of downloaded-but-unapplied blocks held in memory.
pub const BLOCK_BUFFER_CAPACITY: usize = 10;

const SCRIPTS_FILE: &str = "scripts.dat";
const TRANSACTIONS_FILE: &str = "transactions.dat";
const BLOCKS_FILE: &str = "blocks.dat";

/// A transaction plus where the wallet currently believes it sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartTransaction {
    pub transaction: Transaction,
    pub height: Height,
}

impl SmartTransaction {
    pub fn new(transaction: Transaction, height: Height) -> Self {
        Self {
            transaction,
            height,
        }
    }

    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }

    /// Confirmed means mined at a concrete chain height.
    pub fn confirmed(&self) -> bool {
        self.height.is_chain()
    }
}

/// Bounded buffer of downloaded blocks awaiting application.
#[derive(Debug, Default)]
pub struct UnprocessedBlockBuffer {
    blocks: BTreeMap<u32, Block>,
}

impl UnprocessedBlockBuffer {
    pub fn best_height(&self) -> Height {
        match self.blocks.keys().next_back() {
            Some(h) => Height::Chain(*h),
            None => Height::Unknown,
        }
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= BLOCK_BUFFER_CAPACITY
    }

    fn insert(&mut self, height: u32, block: Block) {
        self.blocks.insert(height, block);
    }

    fn pop_first(&mut self) -> Option<(u32, Block)> {
        let height = *self.blocks.keys().next()?;
        self.blocks.remove(&height).map(|b| (height, b))
    }
}

/// Prior tracker state of one transaction touched by a block.
type TouchedTx = (Txid, Option<Height>);

#[derive(Debug, Clone)]
struct AppliedBlock {
    hash: BlockHash,
    touched: Vec<TouchedTx>,
}

pub struct Tracker {
    scripts: HashSet<ScriptBuf>,
    transactions: HashMap<Txid, SmartTransaction>,
    applied: BTreeMap<u32, AppliedBlock>,
    buffer: UnprocessedBlockBuffer,
    change: watch::Sender<u64>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        let (change, _) = watch::channel(0);
        Self {
            scripts: HashSet::new(),
            transactions: HashMap::new(),
            applied: BTreeMap::new(),
            buffer: UnprocessedBlockBuffer::default(),
            change,
        }
    }

    /// Receiver that wakes whenever the tracked-transaction set changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.change.subscribe()
    }

    fn notify_change(&self) {
        self.change.send_modify(|v| *v += 1);
    }

    // ── Scripts ──────────────────────────────────────────────────────────

    /// Register a watched script. Idempotent; the set never shrinks.
    pub fn track_script(&mut self, script: ScriptBuf) -> bool {
        self.scripts.insert(script)
    }

    pub fn is_tracked(&self, script: &Script) -> bool {
        self.scripts.contains(script)
    }

    pub fn tracked_scripts(&self) -> &HashSet<ScriptBuf> {
        &self.scripts
    }

    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    /// A script is clean while no tracked transaction pays to it.
    pub fn is_clean(&self, script: &Script) -> bool {
        !self.transactions.values().any(|stx| {
            stx.transaction
                .output
                .iter()
                .any(|out| out.script_pubkey.as_script() == script)
        })
    }

    // ── Transactions ─────────────────────────────────────────────────────

    pub fn transactions(&self) -> impl Iterator<Item = &SmartTransaction> {
        self.transactions.values()
    }

    pub fn get(&self, txid: &Txid) -> Option<&SmartTransaction> {
        self.transactions.get(txid)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// A transaction is relevant when it pays to a watched script or
    /// spends an output of an already-tracked transaction that pays to
    /// a watched script.
    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        if tx
            .output
            .iter()
            .any(|out| self.scripts.contains(&out.script_pubkey))
        {
            return true;
        }
        tx.input.iter().any(|input| {
            let prev = input.previous_output;
            self.transactions
                .get(&prev.txid)
                .and_then(|stx| stx.transaction.output.get(prev.vout as usize))
                .map(|out| self.scripts.contains(&out.script_pubkey))
                .unwrap_or(false)
        })
    }

    /// Process a transaction observed outside block application (the
    /// mempool feed). Returns true if the tracker changed.
    ///
    /// A concrete chain height always wins over a mempool sighting; a
    /// mempool sighting never demotes a confirmed transaction.
    pub fn process_transaction(&mut self, stx: SmartTransaction) -> bool {
        if !self.is_relevant(&stx.transaction) {
            return false;
        }
        let txid = stx.txid();
        let changed = match self.transactions.get(&txid) {
            None => {
                self.transactions.insert(txid, stx);
                true
            }
            Some(existing) => {
                let upgrade = match (existing.height, stx.height) {
                    (a, b) if a == b => false,
                    (Height::Chain(_), Height::MemPool) => false,
                    (Height::Chain(_), Height::Unknown) => false,
                    _ => true,
                };
                if upgrade {
                    self.transactions.insert(txid, stx);
                }
                upgrade
            }
        };
        if changed {
            self.notify_change();
        }
        changed
    }

    // ── Blocks ───────────────────────────────────────────────────────────

    pub fn best_height(&self) -> Height {
        match self.applied.keys().next_back() {
            Some(h) => Height::Chain(*h),
            None => Height::Unknown,
        }
    }

    pub fn block_count(&self) -> usize {
        self.applied.len()
    }

    pub fn buffer_best_height(&self) -> Height {
        self.buffer.best_height()
    }

    pub fn buffer_full(&self) -> bool {
        self.buffer.is_full()
    }

    /// Queue a block for application at `height`.
    ///
    /// Application happens separately through
    /// [`process_next_block`](Self::process_next_block), in height
    /// order; when the queued height is already applied it is undone
    /// first on application, so re-sending a height replaces it.
    pub fn add_or_replace_block(&mut self, height: u32, block: Block) {
        self.buffer.insert(height, block);
    }

    /// Apply the lowest buffered block; `None` when the buffer is
    /// empty.
    pub fn process_next_block(&mut self) -> Option<u32> {
        let (height, block) = self.buffer.pop_first()?;
        self.apply_block(height, block);
        Some(height)
    }

    /// Apply every buffered block in height order.
    pub fn drain_buffer(&mut self) {
        while self.process_next_block().is_some() {}
    }

    fn apply_block(&mut self, height: u32, block: Block) {
        while self
            .best_height()
            .as_chain()
            .map_or(false, |best| best >= height)
        {
            self.undo_best_block();
        }

        let mut touched: Vec<TouchedTx> = Vec::new();
        for tx in &block.txdata {
            if !self.is_relevant(tx) {
                continue;
            }
            let txid = tx.compute_txid();
            let prior = self.transactions.get(&txid).map(|stx| stx.height);
            if prior == Some(Height::Chain(height)) {
                continue;
            }
            touched.push((txid, prior));
            self.transactions
                .insert(txid, SmartTransaction::new(tx.clone(), Height::Chain(height)));
        }

        self.applied.insert(
            height,
            AppliedBlock {
                hash: block.block_hash(),
                touched,
            },
        );
        log::debug!("applied block at height {}", height);
        // Best height moved even when no transaction was touched.
        self.notify_change();
    }

    /// Undo exactly one block's worth of application.
    pub fn reorg_one(&mut self) {
        self.undo_best_block();
    }

    fn undo_best_block(&mut self) {
        let Some((height, record)) = self.applied.pop_last() else {
            return;
        };
        for (txid, prior) in record.touched.into_iter().rev() {
            match prior {
                None => {
                    self.transactions.remove(&txid);
                }
                Some(height) => {
                    if let Some(stx) = self.transactions.get_mut(&txid) {
                        stx.height = height;
                    }
                }
            }
        }
        log::debug!("rewound block at height {}", height);
        self.notify_change();
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Write the snapshot into `dir` (created if missing).
    pub fn save(&self, dir: &Path) -> Result<(), WalletError> {
        fs::create_dir_all(dir)?;

        let mut scripts = String::new();
        for script in &self.scripts {
            scripts.push_str(&hex::encode(script.as_bytes()));
            scripts.push('\n');
        }
        fs::write(dir.join(SCRIPTS_FILE), scripts)?;

        let mut transactions = String::new();
        for stx in self.transactions.values() {
            transactions.push_str(&format!(
                "{} {}\n",
                encode_height(stx.height),
                hex::encode(serialize(&stx.transaction))
            ));
        }
        fs::write(dir.join(TRANSACTIONS_FILE), transactions)?;

        let mut blocks = String::new();
        for (height, record) in &self.applied {
            let touched = record
                .touched
                .iter()
                .map(|(txid, prior)| {
                    format!(
                        "{}:{}",
                        txid,
                        prior.map(encode_height).unwrap_or_else(|| "-".to_string())
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            blocks.push_str(&format!("{} {} {}\n", height, record.hash, touched));
        }
        fs::write(dir.join(BLOCKS_FILE), blocks)?;
        Ok(())
    }

    /// Load a snapshot previously written by [`Tracker::save`].
    pub fn load(dir: &Path) -> Result<Self, WalletError> {
        let mut tracker = Tracker::new();

        for line in fs::read_to_string(dir.join(SCRIPTS_FILE))?.lines() {
            let bytes = hex::decode(line.trim())
                .map_err(|e| WalletError::Storage(format!("bad script line: {}", e)))?;
            tracker.scripts.insert(ScriptBuf::from_bytes(bytes));
        }

        for line in fs::read_to_string(dir.join(TRANSACTIONS_FILE))?.lines() {
            let (height, tx_hex) = line
                .split_once(' ')
                .ok_or_else(|| WalletError::Storage("bad transaction line".to_string()))?;
            let height = decode_height(height)
                .ok_or_else(|| WalletError::Storage("bad transaction height".to_string()))?;
            let bytes = hex::decode(tx_hex.trim())
                .map_err(|e| WalletError::Storage(format!("bad transaction hex: {}", e)))?;
            let transaction: Transaction = deserialize(&bytes)
                .map_err(|e| WalletError::Storage(format!("bad transaction: {}", e)))?;
            let stx = SmartTransaction::new(transaction, height);
            tracker.transactions.insert(stx.txid(), stx);
        }

        for line in fs::read_to_string(dir.join(BLOCKS_FILE))?.lines() {
            let mut parts = line.splitn(3, ' ');
            let height: u32 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| WalletError::Storage("bad block height".to_string()))?;
            let hash: BlockHash = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| WalletError::Storage("bad block hash".to_string()))?;
            let mut touched = Vec::new();
            for entry in parts.next().unwrap_or("").split(',').filter(|s| !s.is_empty()) {
                let (txid, prior) = entry
                    .split_once(':')
                    .ok_or_else(|| WalletError::Storage("bad touched entry".to_string()))?;
                let txid: Txid = txid
                    .parse()
                    .map_err(|_| WalletError::Storage("bad txid".to_string()))?;
                let prior = match prior {
                    "-" => None,
                    other => Some(
                        decode_height(other)
                            .ok_or_else(|| WalletError::Storage("bad prior height".to_string()))?,
                    ),
                };
                touched.push((txid, prior));
            }
            tracker.applied.insert(height, AppliedBlock { hash, touched });
        }

        Ok(tracker)
    }
}

fn encode_height(height: Height) -> String {
    match height {
        Height::MemPool => "m".to_string(),
        Height::Chain(n) => n.to_string(),
        Height::Unknown => "u".to_string(),
    }
}

fn decode_height(s: &str) -> Option<Height> {
    match s {
        "m" => Some(Height::MemPool),
        "u" => Some(Height::Unknown),
        other => other.parse().ok().map(Height::Chain),
    }
}
