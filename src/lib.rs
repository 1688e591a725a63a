//! spv-kit: an embeddable SPV Bitcoin node
//!
//! This crate provides everything a light wallet needs to follow the
//! Bitcoin network without downloading full blocks:
//! - Merkle block download from peers with BIP37 bloom filters
//! - Header chain validation (linkage, proof of work, difficulty retarget)
//! - HD key tracking with a gap limit
//! - Transaction history, conflict detection and invalidation
//! - Coin selection, fee estimation, signing and broadcasting with retries
//! - An event bus for transaction, balance, block and sync-state updates
//!
//! # Example
//!
//! ```rust,no_run
//! use spv_kit::{CoreConfig, SpvKit};
//! use spv_kit::core::ScriptType;
//! use spv_kit::storage::MemoryStorage;
//! use std::sync::Arc;
//!
//! # async fn run() -> spv_kit::Result<()> {
//! let config = CoreConfig::from_json(r#"{"network": "testnet"}"#)?;
//! let kit = SpvKit::from_seed(config, &[7u8; 32], Arc::new(MemoryStorage::new()))?;
//!
//! let mut events = kit.subscribe();
//! kit.start().await?;
//! println!("Receive at {}", kit.receive_address(ScriptType::P2wpkh)?);
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod events;
pub mod kit;
pub mod network;
pub mod storage;
pub mod sync;
pub mod transactions;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use config::{ConfigError, CoreConfig, SyncMode};
pub use core::{Address, BlockInfo, Checkpoint, FullTransaction, Network, ScriptType};
pub use crypto::Hash256;
pub use error::{Error, Result};
pub use events::{EventDispatcher, KitEvent, Subscription};
pub use kit::SpvKit;
pub use storage::{MemoryStorage, Storage};
pub use sync::{ApiBlockHash, BlockHashFetcher, KitState};
pub use transactions::{TransactionDataSortType, TransactionFilterType, TransactionInfo, WatchedFilter};
pub use wallet::{BalanceInfo, KeyDeriver, SeedKeyDeriver};
