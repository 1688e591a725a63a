//! Block download bookkeeping
//!
//! Queues announced block hashes, connects downloaded merkle blocks and
//! hands their transactions to the block processor. When the processor
//! reports an expired filter, the rest of the iteration is kept as
//! partial blocks and downloaded again with the new filter.

use crate::bloom::{BloomFilterError, BloomFilterManager};
use crate::core::{Block, BlockHash, Checkpoint};
use crate::crypto::Hash256;
use crate::storage::{Storage, StorageError, StorageResult};
use crate::sync::blockchain::Blockchain;
use crate::sync::merkle_block::MerkleBlock;
use crate::sync::validator::BlockValidationError;
use crate::transactions::{BlockTransactionProcessor, ProcessError};
use crate::utils::lock;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Newest stored blocks put in a locator
const LOCATOR_LATEST_BLOCKS: usize = 10;

#[derive(Error, Debug)]
pub enum BlockSyncerError {
    #[error("Block validation failed: {0}")]
    Validation(#[from] BlockValidationError),
    #[error("Processing failed: {0}")]
    Process(#[from] ProcessError),
    #[error("Bloom filter error: {0}")]
    BloomFilter(#[from] BloomFilterError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Default)]
struct BlockSyncerState {
    iteration_has_partial_blocks: bool,
}

pub struct BlockSyncer {
    storage: Arc<dyn Storage>,
    checkpoint: Checkpoint,
    blockchain: Arc<Blockchain>,
    transaction_processor: Arc<BlockTransactionProcessor>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    stale_block_retention: u32,
    state: Mutex<BlockSyncerState>,
}

impl BlockSyncer {
    /// Seeds an empty chain with the checkpoint block
    pub fn new(
        storage: Arc<dyn Storage>,
        checkpoint: Checkpoint,
        blockchain: Arc<Blockchain>,
        transaction_processor: Arc<BlockTransactionProcessor>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        stale_block_retention: u32,
    ) -> StorageResult<Self> {
        if storage.blocks_count()? == 0 {
            log::info!("Starting chain at checkpoint height {}", checkpoint.height);
            storage.add_block(checkpoint.block())?;
        }

        Ok(Self {
            storage,
            checkpoint,
            blockchain,
            transaction_processor,
            bloom_filter_manager,
            stale_block_retention,
            state: Mutex::new(BlockSyncerState::default()),
        })
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Height of the best downloaded block
    pub fn local_download_best_height(&self) -> StorageResult<u32> {
        Ok(self
            .storage
            .last_block()?
            .map_or(self.checkpoint.height, |b| b.height))
    }

    /// Downloaded height plus hashes still queued
    pub fn local_known_best_height(&self) -> StorageResult<u32> {
        Ok(self.local_download_best_height()? + self.storage.block_hashes_count()? as u32)
    }

    // =========================================================================
    // Iteration lifecycle
    // =========================================================================

    /// Reset state left by an interrupted or partial iteration
    pub fn prepare_for_download(&self) -> Result<(), BlockSyncerError> {
        self.handle_partial_blocks()?;
        self.clear_partial_blocks()?;
        self.storage.delete_blockchain_block_hashes()?;
        self.blockchain.handle_fork()?;
        Ok(())
    }

    pub fn download_iteration_completed(&self) -> Result<(), BlockSyncerError> {
        self.handle_partial_blocks()
    }

    pub fn download_completed(&self) -> Result<(), BlockSyncerError> {
        self.blockchain.handle_fork()?;
        let best = self.local_download_best_height()?;
        if let Some(before) = best.checked_sub(self.stale_block_retention) {
            self.delete_useless_blocks(before)?;
        }
        Ok(())
    }

    pub fn download_failed(&self) -> Result<(), BlockSyncerError> {
        self.prepare_for_download()
    }

    fn handle_partial_blocks(&self) -> Result<(), BlockSyncerError> {
        let had_partial = std::mem::take(&mut lock(&self.state).iteration_has_partial_blocks);
        if had_partial {
            log::info!("Regenerating bloom filter for partial blocks");
            self.bloom_filter_manager.regenerate_bloom_filter()?;
        }
        Ok(())
    }

    /// Downloaded blocks whose hash is still queued were only partially
    /// processed; they are dropped to be fetched again
    fn clear_partial_blocks(&self) -> StorageResult<()> {
        let mut partial = Vec::new();
        for hash in self.storage.block_hashes(usize::MAX)? {
            if let Some(block) = self.storage.block(&hash.header_hash)? {
                partial.push(block);
            }
        }
        if !partial.is_empty() {
            log::info!("Dropping {} partial blocks", partial.len());
        }
        self.blockchain.delete_blocks(&partial)
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    /// Locator for `getblocks`: the last queued hash, or the newest
    /// blocks, then the peer's best block or the checkpoint
    pub fn block_locator_hashes(&self, peer_last_block_height: u32) -> StorageResult<Vec<Hash256>> {
        let mut hashes: Vec<Hash256> = Vec::new();
        if let Some(last) = self.storage.last_block_hash()?.filter(|h| h.height.is_none()) {
            hashes.push(last.header_hash);
        }
        if hashes.is_empty() {
            hashes = self
                .storage
                .latest_blocks(LOCATOR_LATEST_BLOCKS)?
                .into_iter()
                .filter(|b| b.height > self.checkpoint.height)
                .map(|b| b.header_hash)
                .collect();
        }

        match self.storage.block_by_height(peer_last_block_height)? {
            Some(peer_block) => {
                if !hashes.contains(&peer_block.header_hash) {
                    hashes.push(peer_block.header_hash);
                }
            }
            None => hashes.push(self.checkpoint.hash()),
        }
        Ok(hashes)
    }

    /// Queue announced hashes we have not downloaded
    pub fn add_block_hashes(&self, hashes: &[Hash256]) -> StorageResult<usize> {
        let mut sequence = self.storage.last_block_hash()?.map_or(0, |h| h.sequence + 1);
        let queued: HashSet<Hash256> = self
            .storage
            .block_hashes(usize::MAX)?
            .into_iter()
            .map(|h| h.header_hash)
            .collect();

        let mut new_hashes = Vec::new();
        for hash in hashes {
            if queued.contains(hash) || self.storage.block(hash)?.is_some() {
                continue;
            }
            new_hashes.push(BlockHash::new(*hash, None, sequence));
            sequence += 1;
        }

        let added = new_hashes.len();
        self.storage.add_block_hashes(new_hashes)?;
        Ok(added)
    }

    pub fn block_hashes(&self, limit: usize) -> StorageResult<Vec<BlockHash>> {
        self.storage.block_hashes(limit)
    }

    pub fn should_request(&self, hash: &Hash256) -> StorageResult<bool> {
        Ok(self.storage.block(hash)?.is_none())
    }

    // =========================================================================
    // Merkle blocks
    // =========================================================================

    pub fn handle_merkle_block(&self, merkle_block: MerkleBlock) -> Result<Block, BlockSyncerError> {
        let mut block = match merkle_block.height {
            Some(height) => self.blockchain.force_add(&merkle_block, height)?,
            None => self.blockchain.connect(&merkle_block)?,
        };

        let skip_check = lock(&self.state).iteration_has_partial_blocks;
        match self
            .transaction_processor
            .process_received(merkle_block.transactions, &block, skip_check)
        {
            Ok(()) => {}
            Err(ProcessError::BloomFilterExpired) => {
                log::info!("Bloom filter expired at block {}", block.height);
                lock(&self.state).iteration_has_partial_blocks = true;
            }
            Err(e) => return Err(e.into()),
        }

        if lock(&self.state).iteration_has_partial_blocks {
            block.partial = true;
            self.storage.update_block(&block)?;
        } else {
            self.storage.delete_block_hash(&block.header_hash)?;
        }
        Ok(block)
    }

    /// Remove blocks below `before_height` confirming none of our
    /// transactions; the checkpoint block stays
    pub fn delete_useless_blocks(&self, before_height: u32) -> StorageResult<usize> {
        let checkpoint_hash = self.checkpoint.hash();
        let mut useless = Vec::new();
        for block in self.storage.blocks(false)? {
            if block.height >= before_height {
                break;
            }
            if block.header_hash != checkpoint_hash
                && self.storage.transactions_of_block(&block.header_hash)?.is_empty()
            {
                useless.push(block.header_hash);
            }
        }
        if !useless.is_empty() {
            log::debug!("Deleting {} blocks below height {}", useless.len(), before_height);
            self.storage.delete_blocks(&useless)?;
        }
        Ok(useless.len())
    }
}
