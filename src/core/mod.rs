//! Core protocol types
//!
//! This module contains the building blocks everything else works on:
//! - Binary encoding (var-ints, little-endian readers and writers)
//! - Scripts, addresses and chain parameters
//! - Transactions (with segwit serialization and signature hashes)
//! - Block headers, block records and checkpoints
//! - Transaction size and dust estimation

pub mod address;
pub mod block;
pub mod checkpoint;
pub mod encoding;
pub mod fee;
pub mod network;
pub mod public_key;
pub mod script;
pub mod transaction;

pub use address::{
    Address, AddressConverter, AddressConverterChain, AddressError, Base58AddressConverter,
    SegwitAddressConverter,
};
pub use block::{Block, BlockHash, BlockHeader, BlockInfo, BLOCK_HEADER_SIZE};
pub use checkpoint::{genesis_header, Checkpoint, CheckpointManager, CheckpointResult};
pub use encoding::{write_var_bytes, write_var_int, ByteReader, EncodingError};
pub use fee::{BitcoinSizeCalculator, DustCalculator, FeeRate, TransactionSizeCalculator};
pub use network::{Network, PROTOCOL_VERSION};
pub use public_key::PublicKey;
pub use script::{classify_input, classify_output, lock_script, ScriptError, ScriptType};
pub use transaction::{
    FullTransaction, Input, OutPoint, Output, Transaction, TransactionMetadata,
    TransactionStatus, TransactionType, SEQUENCE_FINAL, SEQUENCE_LOCKTIME, TX_VERSION,
};
