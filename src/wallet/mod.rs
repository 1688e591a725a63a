//! Wallet keys and funds
//!
//! - `hd`: the key derivation seam
//! - `public_key_manager`: gap-limit key bookkeeping
//! - `unspent`: spendable outputs and balance

pub mod hd;
pub mod public_key_manager;
pub mod unspent;

pub use hd::{KeyDerivationError, KeyDeriver, SeedKeyDeriver};
pub use public_key_manager::{PublicKeyManager, PublicKeyManagerError};
pub use unspent::{BalanceInfo, UnspentOutputProvider};
