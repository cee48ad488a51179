//! Block height with the unknown and mempool sentinels.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a transaction (or the wallet's view of the chain) currently sits.
///
/// Only two `Chain` values (or two equal values) are mutually
/// comparable; any other comparison against `Unknown` or `MemPool`
/// yields `None` so callers are forced to guard the sentinel cases
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Height {
    /// Not yet determined.
    Unknown,
    /// Seen in the mempool, not yet mined.
    MemPool,
    /// Mined at the given block height.
    Chain(u32),
}

impl Height {
    /// True when this is a concrete chain height.
    pub fn is_chain(&self) -> bool {
        matches!(self, Height::Chain(_))
    }

    /// The concrete chain height, if there is one.
    pub fn as_chain(&self) -> Option<u32> {
        match self {
            Height::Chain(n) => Some(*n),
            _ => None,
        }
    }

}

impl PartialOrd for Height {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Height::Chain(a), Height::Chain(b)) => Some(a.cmp(b)),
            // A sentinel equals itself; PartialOrd must agree with
            // PartialEq there.
            _ if self == other => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Height::Unknown => write!(f, "unknown"),
            Height::MemPool => write!(f, "mempool"),
            Height::Chain(n) => write!(f, "{}", n),
        }
    }
}

impl From<u32> for Height {
    fn from(n: u32) -> Self {
        Height::Chain(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_heights_are_ordered() {
        assert!(Height::Chain(5) < Height::Chain(6));
        assert!(Height::Chain(6) > Height::Chain(5));
        assert_eq!(
            Height::Chain(7).partial_cmp(&Height::Chain(7)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_distinct_sentinels_are_not_comparable() {
        assert_eq!(Height::Unknown.partial_cmp(&Height::Chain(0)), None);
        assert_eq!(Height::MemPool.partial_cmp(&Height::Chain(100)), None);
        assert_eq!(Height::Unknown.partial_cmp(&Height::MemPool), None);
    }

    #[test]
    fn test_sentinels_equal_themselves() {
        assert_eq!(
            Height::Unknown.partial_cmp(&Height::Unknown),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Height::MemPool.partial_cmp(&Height::MemPool),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_as_chain() {
        assert_eq!(Height::Chain(42).as_chain(), Some(42));
        assert_eq!(Height::MemPool.as_chain(), None);
        assert_eq!(Height::Unknown.as_chain(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Height::Unknown.to_string(), "unknown");
        assert_eq!(Height::MemPool.to_string(), "mempool");
        assert_eq!(Height::Chain(123).to_string(), "123");
    }
}
