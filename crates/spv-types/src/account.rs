//! Derivation accounts and HD path types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One derivation sub-branch of the wallet.
///
/// Equality is by identifier. The wallet's default branch is not a
/// `SafeAccount`; it sits outside the account set and is tracked only
/// when enabled by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SafeAccount {
    id: u32,
}

impl SafeAccount {
    pub fn new(id: u32) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for SafeAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account-{}", self.id)
    }
}

/// The derivation path branches scanned independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HdPathType {
    Receive,
    Change,
    NonHardened,
}

impl HdPathType {
    /// All path types, in scan order.
    pub const ALL: [HdPathType; 3] = [
        HdPathType::Receive,
        HdPathType::Change,
        HdPathType::NonHardened,
    ];
}
