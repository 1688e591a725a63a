//! Crate-level error
//!
//! Every module keeps its own error enum; this one gathers them for the
//! `SpvKit` surface.

use crate::bloom::BloomFilterError;
use crate::config::ConfigError;
use crate::core::{AddressError, EncodingError, ScriptError};
use crate::crypto::KeyError;
use crate::network::{PeerError, WireError};
use crate::storage::StorageError;
use crate::sync::{ApiSyncError, BlockSyncerError, BlockValidationError, MerkleBlockValidationError};
use crate::transactions::{
    BuildError, ProcessError, SendValueError, SignError, TransactionCreationError, TransactionSendError,
};
use crate::wallet::{KeyDerivationError, PublicKeyManagerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Key derivation error: {0}")]
    KeyDerivation(#[from] KeyDerivationError),
    #[error("Public key error: {0}")]
    PublicKeys(#[from] PublicKeyManagerError),
    #[error(transparent)]
    SendValue(#[from] SendValueError),
    #[error("Signing failed: {0}")]
    Sign(#[from] SignError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Creation(#[from] TransactionCreationError),
    #[error(transparent)]
    Send(#[from] TransactionSendError),
    #[error("Processing failed: {0}")]
    Process(#[from] ProcessError),
    #[error("Block validation failed: {0}")]
    BlockValidation(#[from] BlockValidationError),
    #[error("Merkle block validation failed: {0}")]
    MerkleBlock(#[from] MerkleBlockValidationError),
    #[error("Block sync error: {0}")]
    BlockSync(#[from] BlockSyncerError),
    #[error("API sync error: {0}")]
    ApiSync(#[from] ApiSyncError),
    #[error("Bloom filter error: {0}")]
    BloomFilter(#[from] BloomFilterError),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid transaction hash: {0}")]
    InvalidHash(String),
    #[error("Kit is already running")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, Error>;
