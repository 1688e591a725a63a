//! Partial merkle tree verification
//!
//! A `merkleblock` proves which transactions of a block matched our
//! filter. The proof is walked depth first, consuming one flag bit per
//! visited node and one hash per pruned subtree or leaf.

use crate::core::block::MAX_BLOCK_TRANSACTIONS;
use crate::core::{BlockHeader, FullTransaction};
use crate::crypto::{merkle_parent, Hash256};
use crate::network::message::MerkleBlockMessage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleBlockValidationError {
    #[error("Merkle block has no transactions")]
    NoTransactions,
    #[error("Merkle block has too many transactions")]
    TooManyTransactions,
    #[error("More hashes than transactions")]
    MoreHashesThanTransactions,
    #[error("Not enough flag bits")]
    NotEnoughBits,
    #[error("Not enough hashes")]
    NotEnoughHashes,
    #[error("Flag bits left unused")]
    UnusedBits,
    #[error("Hashes left unused")]
    UnusedHashes,
    #[error("Identical sibling hashes")]
    DuplicateHashes,
    #[error("Merkle root does not match the header")]
    WrongMerkleRoot,
}

/// A verified filtered block and the matched transactions received for it
#[derive(Debug, Clone)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub header_hash: Hash256,
    pub matched_hashes: Vec<Hash256>,
    pub transactions: Vec<FullTransaction>,
    /// Height known in advance for API-restored hashes
    pub height: Option<u32>,
}

impl MerkleBlock {
    /// All matched transactions have arrived
    pub fn is_complete(&self) -> bool {
        self.transactions.len() >= self.matched_hashes.len()
    }

    /// Keep `tx` if the block proved it; returns whether it was taken
    pub fn add_transaction(&mut self, tx: FullTransaction) -> bool {
        let hash = tx.hash();
        if !self.matched_hashes.contains(&hash) || self.transactions.iter().any(|t| t.hash() == hash) {
            return false;
        }
        self.transactions.push(tx);
        true
    }
}

struct Traversal<'a> {
    total: u32,
    hashes: &'a [Hash256],
    flags: &'a [u8],
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Hash256>,
}

impl Traversal<'_> {
    fn width(&self, height: u32) -> u32 {
        (self.total + (1 << height) - 1) >> height
    }

    fn next_bit(&mut self) -> Result<bool, MerkleBlockValidationError> {
        if self.bits_used >= self.flags.len() * 8 {
            return Err(MerkleBlockValidationError::NotEnoughBits);
        }
        let bit = (self.flags[self.bits_used / 8] >> (self.bits_used % 8)) & 1 == 1;
        self.bits_used += 1;
        Ok(bit)
    }

    fn next_hash(&mut self) -> Result<Hash256, MerkleBlockValidationError> {
        let hash = self
            .hashes
            .get(self.hashes_used)
            .copied()
            .ok_or(MerkleBlockValidationError::NotEnoughHashes)?;
        self.hashes_used += 1;
        Ok(hash)
    }

    fn traverse(&mut self, height: u32, position: u32) -> Result<Hash256, MerkleBlockValidationError> {
        let parent_of_match = self.next_bit()?;
        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matched.push(hash);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, position * 2)?;
        let right = if position * 2 + 1 < self.width(height - 1) {
            let right = self.traverse(height - 1, position * 2 + 1)?;
            if right == left {
                return Err(MerkleBlockValidationError::DuplicateHashes);
            }
            right
        } else {
            left
        };
        Ok(merkle_parent(&left, &right))
    }
}

#[derive(Debug, Clone)]
pub struct MerkleBlockValidator {
    max_transactions: u32,
}

impl Default for MerkleBlockValidator {
    fn default() -> Self {
        Self {
            max_transactions: MAX_BLOCK_TRANSACTIONS,
        }
    }
}

impl MerkleBlockValidator {
    pub fn new(max_transactions: u32) -> Self {
        Self { max_transactions }
    }

    pub fn validate(&self, message: MerkleBlockMessage) -> Result<MerkleBlock, MerkleBlockValidationError> {
        let total = message.total_transactions;
        if total == 0 {
            return Err(MerkleBlockValidationError::NoTransactions);
        }
        if total > self.max_transactions {
            return Err(MerkleBlockValidationError::TooManyTransactions);
        }
        if message.hashes.len() as u64 > total as u64 {
            return Err(MerkleBlockValidationError::MoreHashesThanTransactions);
        }
        if message.flags.len() * 8 < message.hashes.len() {
            return Err(MerkleBlockValidationError::NotEnoughBits);
        }

        let mut traversal = Traversal {
            total,
            hashes: &message.hashes,
            flags: &message.flags,
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
        };
        let mut height = 0;
        while traversal.width(height) > 1 {
            height += 1;
        }
        let root = traversal.traverse(height, 0)?;

        if (traversal.bits_used + 7) / 8 != message.flags.len() {
            return Err(MerkleBlockValidationError::UnusedBits);
        }
        if traversal.hashes_used != message.hashes.len() {
            return Err(MerkleBlockValidationError::UnusedHashes);
        }
        if root != message.header.merkle_root {
            return Err(MerkleBlockValidationError::WrongMerkleRoot);
        }

        let header_hash = message.header.hash();
        Ok(MerkleBlock {
            header: message.header,
            header_hash,
            matched_hashes: traversal.matched,
            transactions: Vec::new(),
            height: None,
        })
    }
}
