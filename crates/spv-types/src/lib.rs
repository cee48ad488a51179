//! Core types for the SPV wallet engine.
//!
//! This crate provides the foundational types shared across the engine
//! crates: block heights with the unknown/mempool sentinels, network
//! identifiers, wallet lifecycle states, derivation accounts and path
//! types, and fee tiers. It deliberately carries no Bitcoin primitives
//! and no I/O.

pub mod account;
pub mod height;
pub mod network;
pub mod state;

pub use account::{HdPathType, SafeAccount};
pub use height::Height;
pub use network::Network;
pub use state::{FeeTier, WalletState};
