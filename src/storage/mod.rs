//! Storage layer
//!
//! `Storage` is the interface the kit queries and commands. It is the
//! single source of truth: balances, unspent outputs and key usage are
//! always derived from it on demand. `MemoryStorage` implements it in
//! memory and can be snapshotted to disk as JSON.

pub mod memory;
pub mod persistence;
pub mod records;

pub use memory::MemoryStorage;
pub use persistence::{load_snapshot, save_snapshot, StorageSnapshot};
pub use records::{
    InvalidTransaction, PeerAddress, PublicKeyWithUsedState, SentTransaction, UnspentOutput,
};

use crate::core::{Block, BlockHash, FullTransaction, Input, OutPoint, Output, PublicKey, Transaction};
use crate::crypto::Hash256;
use std::io;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Query/command interface over wallet state
pub trait Storage: Send + Sync {
    // =========================================================================
    // Blocks
    // =========================================================================

    /// Highest block, stale or not
    fn last_block(&self) -> StorageResult<Option<Block>>;

    fn block(&self, hash: &Hash256) -> StorageResult<Option<Block>>;

    /// Block at `height`, preferring the non-stale one
    fn block_by_height(&self, height: u32) -> StorageResult<Option<Block>>;

    fn blocks_count(&self) -> StorageResult<usize>;

    /// Blocks with the given stale flag, ascending by height
    fn blocks(&self, stale: bool) -> StorageResult<Vec<Block>>;

    /// Non-stale blocks, highest first
    fn latest_blocks(&self, count: usize) -> StorageResult<Vec<Block>>;

    fn add_block(&self, block: Block) -> StorageResult<()>;

    fn update_block(&self, block: &Block) -> StorageResult<()>;

    /// Remove blocks; transactions they confirmed are left in place
    fn delete_blocks(&self, hashes: &[Hash256]) -> StorageResult<()>;

    fn unstale_all_blocks(&self) -> StorageResult<()>;

    // =========================================================================
    // Block hashes
    // =========================================================================

    fn add_block_hashes(&self, hashes: Vec<BlockHash>) -> StorageResult<()>;

    /// Queued hashes ordered by sequence
    fn block_hashes(&self, limit: usize) -> StorageResult<Vec<BlockHash>>;

    fn last_block_hash(&self) -> StorageResult<Option<BlockHash>>;

    fn block_hashes_count(&self) -> StorageResult<usize>;

    fn delete_block_hash(&self, hash: &Hash256) -> StorageResult<()>;

    /// Drop hashes discovered through locators; API-restored ones, which
    /// carry a height, stay queued
    fn delete_blockchain_block_hashes(&self) -> StorageResult<()>;

    // =========================================================================
    // Transactions
    // =========================================================================

    fn transaction(&self, hash: &Hash256) -> StorageResult<Option<Transaction>>;

    fn full_transaction(&self, hash: &Hash256) -> StorageResult<Option<FullTransaction>>;

    fn full_transaction_by_uid(&self, uid: &str) -> StorageResult<Option<FullTransaction>>;

    /// Every valid transaction
    fn full_transactions(&self) -> StorageResult<Vec<FullTransaction>>;

    fn transactions_of_block(&self, block_hash: &Hash256) -> StorageResult<Vec<FullTransaction>>;

    /// Valid transactions not yet in a block
    fn pending_transactions(&self) -> StorageResult<Vec<FullTransaction>>;

    /// Created locally and not yet relayed back
    fn new_transactions(&self) -> StorageResult<Vec<FullTransaction>>;

    fn add_transaction(&self, transaction: FullTransaction) -> StorageResult<()>;

    /// Replace the header of a stored transaction
    fn update_transaction(&self, header: &Transaction) -> StorageResult<()>;

    /// Replace one stored output
    fn update_output(&self, output: &Output) -> StorageResult<()>;

    fn delete_transaction(&self, hash: &Hash256) -> StorageResult<()>;

    /// Output of a valid transaction
    fn output(&self, outpoint: &OutPoint) -> StorageResult<Option<Output>>;

    /// Inputs of valid transactions spending `outpoint`
    fn inputs_spending(&self, outpoint: &OutPoint) -> StorageResult<Vec<Input>>;

    /// Wallet outputs no valid transaction spends
    fn unspent_outputs(&self) -> StorageResult<Vec<UnspentOutput>>;

    // =========================================================================
    // Invalid transactions
    // =========================================================================

    fn invalid_transaction(&self, hash: &Hash256) -> StorageResult<Option<InvalidTransaction>>;

    fn invalid_transactions(&self) -> StorageResult<Vec<InvalidTransaction>>;

    /// Remove the transactions from the valid set and keep their snapshots
    fn move_to_invalid(&self, transactions: Vec<InvalidTransaction>) -> StorageResult<()>;

    fn delete_invalid_transaction(&self, hash: &Hash256) -> StorageResult<()>;

    // =========================================================================
    // Public keys
    // =========================================================================

    fn public_keys(&self) -> StorageResult<Vec<PublicKey>>;

    fn public_key(&self, path: &str) -> StorageResult<Option<PublicKey>>;

    /// Key whose hash, P2WPKH script hash or raw bytes equal `hash`
    fn public_key_by_hash(&self, hash: &[u8]) -> StorageResult<Option<PublicKey>>;

    fn add_public_keys(&self, keys: Vec<PublicKey>) -> StorageResult<()>;

    fn public_keys_with_used_state(&self) -> StorageResult<Vec<PublicKeyWithUsedState>>;

    // =========================================================================
    // Sent transactions
    // =========================================================================

    fn sent_transaction(&self, hash: &Hash256) -> StorageResult<Option<SentTransaction>>;

    /// Insert or replace
    fn save_sent_transaction(&self, sent: SentTransaction) -> StorageResult<()>;

    fn delete_sent_transaction(&self, hash: &Hash256) -> StorageResult<()>;

    // =========================================================================
    // Peer addresses
    // =========================================================================

    /// Best-scored addresses not in `exclude`
    fn peer_addresses(&self, exclude: &[String], limit: usize) -> StorageResult<Vec<PeerAddress>>;

    /// Add addresses not already known
    fn add_peer_addresses(&self, addresses: Vec<PeerAddress>) -> StorageResult<()>;

    fn increase_peer_address_score(&self, ip: &str) -> StorageResult<()>;

    fn set_peer_connection_time(&self, ip: &str, time: i64) -> StorageResult<()>;

    fn delete_peer_address(&self, ip: &str) -> StorageResult<()>;

    // =========================================================================
    // Wallet
    // =========================================================================

    /// Drop transactions, sent records, queued hashes and blocks above
    /// `keep_up_to_height`; public keys and peers are kept
    fn clear(&self, keep_up_to_height: u32) -> StorageResult<()>;
}
