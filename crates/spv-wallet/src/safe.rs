//! HD key vault.
//!
//! Derives the wallet's watched scripts and resolves signing keys. The
//! engine only consumes the [`KeySource`] trait; [`Safe`] is the BIP32
//! implementation of it.

use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::key::{CompressedPublicKey, PrivateKey};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Script, ScriptBuf};
use spv_types::{HdPathType, SafeAccount};

use crate::error::WalletError;

/// No wallet handled by this engine can predate this instant (unix
/// seconds); used to short-circuit creation-height resolution while the
/// header chain is still far behind.
pub const EARLIEST_POSSIBLE_CREATION_TIME: u64 = 1_483_228_800;

/// Key/derivation service consumed by the engine.
pub trait KeySource: Send + Sync {
    fn network(&self) -> bitcoin::Network;

    /// Unix time the wallet was created.
    fn creation_time(&self) -> u64;

    /// Lower bound on any wallet's creation time.
    fn earliest_possible_creation_time(&self) -> u64 {
        EARLIEST_POSSIBLE_CREATION_TIME
    }

    /// Script pubkey at `index` of the given path branch.
    fn script_pubkey(
        &self,
        index: u32,
        path: HdPathType,
        account: Option<&SafeAccount>,
    ) -> Result<ScriptBuf, WalletError>;

    /// Find the private key whose script matches, scanning the first
    /// `window` indices of every path branch of the account.
    fn find_private_key(
        &self,
        script: &Script,
        window: u32,
        account: Option<&SafeAccount>,
    ) -> Result<PrivateKey, WalletError>;
}

/// Map the engine network onto the Bitcoin primitive network.
pub fn bitcoin_network(network: spv_types::Network) -> bitcoin::Network {
    match network {
        spv_types::Network::Main => bitcoin::Network::Bitcoin,
        spv_types::Network::Test => bitcoin::Network::Testnet,
    }
}

/// BIP32 key vault producing P2WPKH scripts.
///
/// Layout: `m/branch'/path'/index`, where `branch` is `0'` for the
/// default branch and `id+1`' for an account, `path` encodes the
/// [`HdPathType`], and the leaf index is hardened except on the
/// `NonHardened` branch.
pub struct Safe {
    master: Xpriv,
    network: bitcoin::Network,
    creation_time: u64,
    secp: Secp256k1<All>,
}

impl Safe {
    pub fn new(master: Xpriv, network: bitcoin::Network, creation_time: u64) -> Self {
        Self {
            master,
            network,
            creation_time,
            secp: Secp256k1::new(),
        }
    }

    pub fn from_seed(
        seed: &[u8],
        network: bitcoin::Network,
        creation_time: u64,
    ) -> Result<Self, WalletError> {
        let master = Xpriv::new_master(network, seed)
            .map_err(|e| WalletError::Key(e.to_string()))?;
        Ok(Self::new(master, network, creation_time))
    }

    fn derivation(
        &self,
        index: u32,
        path: HdPathType,
        account: Option<&SafeAccount>,
    ) -> Result<Vec<ChildNumber>, WalletError> {
        let key_err = |e: bitcoin::bip32::Error| WalletError::Key(e.to_string());
        let branch = match account {
            None => 0,
            Some(acc) => acc
                .id()
                .checked_add(1)
                .ok_or_else(|| WalletError::Key("account id out of range".into()))?,
        };
        let path_code = match path {
            HdPathType::Receive => 0,
            HdPathType::Change => 1,
            HdPathType::NonHardened => 2,
        };
        let leaf = match path {
            HdPathType::NonHardened => ChildNumber::from_normal_idx(index).map_err(key_err)?,
            _ => ChildNumber::from_hardened_idx(index).map_err(key_err)?,
        };
        Ok(vec![
            ChildNumber::from_hardened_idx(branch).map_err(key_err)?,
            ChildNumber::from_hardened_idx(path_code).map_err(key_err)?,
            leaf,
        ])
    }

    fn private_key_at(
        &self,
        index: u32,
        path: HdPathType,
        account: Option<&SafeAccount>,
    ) -> Result<PrivateKey, WalletError> {
        let derivation = self.derivation(index, path, account)?;
        let child = self
            .master
            .derive_priv(&self.secp, &derivation)
            .map_err(|e| WalletError::Key(e.to_string()))?;
        Ok(child.to_priv())
    }

    fn script_for(&self, key: &PrivateKey) -> Result<ScriptBuf, WalletError> {
        let pubkey = CompressedPublicKey::from_private_key(&self.secp, key)
            .map_err(|e| WalletError::Key(e.to_string()))?;
        Ok(ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()))
    }
}

impl KeySource for Safe {
    fn network(&self) -> bitcoin::Network {
        self.network
    }

    fn creation_time(&self) -> u64 {
        self.creation_time
    }

    fn script_pubkey(
        &self,
        index: u32,
        path: HdPathType,
        account: Option<&SafeAccount>,
    ) -> Result<ScriptBuf, WalletError> {
        let key = self.private_key_at(index, path, account)?;
        self.script_for(&key)
    }

    fn find_private_key(
        &self,
        script: &Script,
        window: u32,
        account: Option<&SafeAccount>,
    ) -> Result<PrivateKey, WalletError> {
        for path in HdPathType::ALL {
            for index in 0..window {
                let key = self.private_key_at(index, path, account)?;
                if self.script_for(&key)?.as_script() == script {
                    return Ok(key);
                }
            }
        }
        Err(WalletError::Key(format!(
            "no key found for script {} within window {}",
            script, window
        )))
    }
}
