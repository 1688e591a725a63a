//! Checkpoint System
//!
//! A checkpoint is a trusted header at a known height. The local chain
//! is anchored on one, and headers arriving at a checkpointed height
//! must match it.

use crate::core::block::{Block, BlockHeader};
use crate::core::network::Network;
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Merkle root of the genesis coinbase, identical on every network
const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
];

/// Genesis header of a network
pub fn genesis_header(network: Network) -> BlockHeader {
    let (timestamp, bits, nonce) = match network {
        Network::Mainnet => (1_231_006_505, 0x1d00_ffff, 2_083_236_893),
        Network::Testnet => (1_296_688_602, 0x1d00_ffff, 414_098_458),
        Network::Regtest => (1_296_688_602, 0x207f_ffff, 2),
    };

    BlockHeader {
        version: 1,
        previous_block_hash: Hash256::ZERO,
        merkle_root: Hash256(GENESIS_MERKLE_ROOT),
        timestamp,
        bits,
        nonce,
    }
}

// =============================================================================
// Checkpoint Entry
// =============================================================================

/// A known-good header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub header: BlockHeader,
}

impl Checkpoint {
    pub fn new(height: u32, header: BlockHeader) -> Self {
        Self { height, header }
    }

    pub fn genesis(network: Network) -> Self {
        Self::new(0, genesis_header(network))
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// The stored block this checkpoint seeds the chain with
    pub fn block(&self) -> Block {
        Block::new(self.header.clone(), self.height)
    }
}

// =============================================================================
// Checkpoint Manager
// =============================================================================

/// Checkpoints of one network, ordered by height
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    network: Network,
    checkpoints: BTreeMap<u32, Checkpoint>,
}

impl CheckpointManager {
    /// Built-in checkpoints of `network`
    pub fn new(network: Network) -> Self {
        let mut manager = Self {
            network,
            checkpoints: BTreeMap::new(),
        };
        manager.add_checkpoint(Checkpoint::genesis(network));
        manager
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.insert(checkpoint.height, checkpoint);
    }

    /// Anchor for restoring an existing wallet: the lowest checkpoint, so
    /// no past payment is skipped
    pub fn restore_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next()
    }

    /// Anchor for a freshly created wallet: nothing before it can concern us
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next_back()
    }

    pub fn get_checkpoint(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.get(&height)
    }

    /// Check a header hash against the checkpoint at its height
    pub fn verify_checkpoint(&self, height: u32, hash: &Hash256) -> CheckpointResult {
        match self.checkpoints.get(&height) {
            Some(cp) => {
                let expected = cp.hash();
                if &expected == hash {
                    CheckpointResult::Match
                } else {
                    CheckpointResult::Mismatch {
                        expected,
                        got: *hash,
                    }
                }
            }
            None => CheckpointResult::NoCheckpoint,
        }
    }

    pub fn is_checkpoint_hash(&self, hash: &Hash256) -> bool {
        self.checkpoints.values().any(|cp| &cp.hash() == hash)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

// =============================================================================
// Checkpoint Result
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointResult {
    Match,
    Mismatch { expected: Hash256, got: Hash256 },
    NoCheckpoint,
}

impl CheckpointResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, CheckpointResult::Match | CheckpointResult::NoCheckpoint)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            Checkpoint::genesis(Network::Testnet).hash().to_hex(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            Checkpoint::genesis(Network::Regtest).hash().to_hex(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
        assert_eq!(
            genesis_header(Network::Mainnet).merkle_root.to_hex(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
    }

    #[test]
    fn test_checkpoint_verification() {
        let manager = CheckpointManager::new(Network::Mainnet);
        let genesis = Checkpoint::genesis(Network::Mainnet).hash();

        assert_eq!(manager.verify_checkpoint(0, &genesis), CheckpointResult::Match);
        assert!(matches!(
            manager.verify_checkpoint(0, &Hash256::ZERO),
            CheckpointResult::Mismatch { .. }
        ));
        assert_eq!(
            manager.verify_checkpoint(150, &genesis),
            CheckpointResult::NoCheckpoint
        );
        assert!(manager.is_checkpoint_hash(&genesis));
    }

    #[test]
    fn test_restore_and_last_checkpoint() {
        let mut manager = CheckpointManager::new(Network::Regtest);
        let later = Checkpoint::new(
            500,
            BlockHeader {
                nonce: 7,
                ..genesis_header(Network::Regtest)
            },
        );
        manager.add_checkpoint(later.clone());

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.restore_checkpoint().unwrap().height, 0);
        assert_eq!(manager.last_checkpoint(), Some(&later));
    }
}
