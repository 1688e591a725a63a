//! Block headers and the block records the kit stores
//!
//! Only 80-byte headers are ever held; transactions arrive separately
//! through merkle blocks.

use crate::core::encoding::{ByteReader, EncodingError};
use crate::crypto::{meets_target, Hash256};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

// =============================================================================
// Block Constants
// =============================================================================

/// Serialized header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Upper bound on transactions in one block (1MB / minimal transaction)
pub const MAX_BLOCK_TRANSACTIONS: u32 = 1_000_000 / 60;

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_block_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE);
        buf.put_i32_le(self.version);
        buf.put_slice(self.previous_block_hash.as_bytes());
        buf.put_slice(self.merkle_root.as_bytes());
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
        buf
    }

    pub fn deserialize(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            version: reader.read_i32_le()?,
            previous_block_hash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32_le()?,
            bits: reader.read_u32_le()?,
            nonce: reader.read_u32_le()?,
        })
    }

    /// Double-SHA256 of the serialized header
    pub fn hash(&self) -> Hash256 {
        Hash256::digest(&self.serialize())
    }

    /// Header hash is at or below the target encoded in `bits`
    pub fn has_valid_proof_of_work(&self) -> bool {
        meets_target(&self.hash(), self.bits)
    }
}

// =============================================================================
// Block
// =============================================================================

/// A header placed in the local chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub header_hash: Hash256,
    pub height: u32,
    /// Connected but not yet confirmed as part of the best chain
    pub stale: bool,
    /// Some matched transactions were not received because the bloom
    /// filter expired while the block was being processed
    pub partial: bool,
}

impl Block {
    pub fn new(header: BlockHeader, height: u32) -> Self {
        let header_hash = header.hash();
        Self {
            header,
            header_hash,
            height,
            stale: false,
            partial: false,
        }
    }

    /// Block extending `previous`, height deduced from it
    pub fn with_previous(header: BlockHeader, previous: &Block) -> Self {
        Self::new(header, previous.height + 1)
    }

    pub fn previous_block_hash(&self) -> &Hash256 {
        &self.header.previous_block_hash
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }
}

/// A block known only by hash, before its header has been downloaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    pub header_hash: Hash256,
    /// Known for hashes restored through an API, unknown for locator results
    pub height: Option<u32>,
    /// Position in the download queue
    pub sequence: u32,
}

impl BlockHash {
    pub fn new(header_hash: Hash256, height: Option<u32>, sequence: u32) -> Self {
        Self {
            header_hash,
            height,
            sequence,
        }
    }
}

/// Summary of a block handed to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub header_hash: String,
    pub height: u32,
    pub timestamp: Option<u32>,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        Self {
            header_hash: block.header_hash.to_hex(),
            height: block.height,
            timestamp: Some(block.header.timestamp),
        }
    }
}
