//! In-memory header chain.
//!
//! Height-indexed list of block headers starting at a checkpoint (or
//! genesis). The engine reads the tip and per-height headers during
//! sync, rewinds the tip by one block during a reorg, and persists the
//! whole chain as a consensus-encoded byte stream.

use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::BlockHash;

use crate::error::WalletError;

const HEADER_SIZE: usize = 80;

#[derive(Debug, Clone)]
pub struct HeaderChain {
    base_height: u32,
    headers: Vec<Header>,
}

impl HeaderChain {
    /// Start a chain from a trusted header at `base_height`.
    pub fn new(base: Header, base_height: u32) -> Self {
        Self {
            base_height,
            headers: vec![base],
        }
    }

    pub fn base_height(&self) -> u32 {
        self.base_height
    }

    /// Height of the current tip.
    pub fn height(&self) -> u32 {
        self.base_height + (self.headers.len() as u32 - 1)
    }

    pub fn tip(&self) -> &Header {
        self.headers.last().expect("chain holds at least the base header")
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.tip().block_hash()
    }

    pub fn header_at(&self, height: u32) -> Option<&Header> {
        if height < self.base_height {
            return None;
        }
        self.headers.get((height - self.base_height) as usize)
    }

    /// Block time at `height`, unix seconds.
    pub fn time_at(&self, height: u32) -> Option<u64> {
        self.header_at(height).map(|h| u64::from(h.time))
    }

    /// Extend the tip. The header must connect to the current tip.
    pub fn append(&mut self, header: Header) -> Result<(), WalletError> {
        if header.prev_blockhash != self.tip_hash() {
            return Err(WalletError::Chain(format!(
                "header {} does not connect to tip {}",
                header.block_hash(),
                self.tip_hash()
            )));
        }
        self.headers.push(header);
        Ok(())
    }

    /// Rewind the tip to its immediate predecessor.
    pub fn rewind_tip(&mut self) -> Result<(), WalletError> {
        if self.headers.len() == 1 {
            return Err(WalletError::Chain(
                "cannot rewind past the base header".to_string(),
            ));
        }
        self.headers.pop();
        Ok(())
    }

    /// Serialize as `base_height (LE u32)` followed by 80-byte headers.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.headers.len() * HEADER_SIZE);
        bytes.extend_from_slice(&self.base_height.to_le_bytes());
        for header in &self.headers {
            bytes.extend_from_slice(&serialize(header));
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        if bytes.len() < 4 + HEADER_SIZE || (bytes.len() - 4) % HEADER_SIZE != 0 {
            return Err(WalletError::Storage(
                "malformed header chain file".to_string(),
            ));
        }
        let mut base_height_bytes = [0u8; 4];
        base_height_bytes.copy_from_slice(&bytes[..4]);
        let base_height = u32::from_le_bytes(base_height_bytes);

        let mut headers = Vec::with_capacity((bytes.len() - 4) / HEADER_SIZE);
        for chunk in bytes[4..].chunks_exact(HEADER_SIZE) {
            let header: Header = deserialize(chunk)
                .map_err(|e| WalletError::Storage(format!("bad header: {}", e)))?;
            headers.push(header);
        }
        Ok(Self {
            base_height,
            headers,
        })
    }
}
