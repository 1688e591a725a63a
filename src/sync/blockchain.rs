//! Local header chain
//!
//! Blocks connected during a download iteration are stored `stale`.
//! When the iteration ends, the fork handler keeps the longer of the new
//! and the previously confirmed branch.

use crate::core::{Block, BlockInfo, TransactionStatus};
use crate::crypto::Hash256;
use crate::events::{EventDispatcher, KitEvent};
use crate::storage::{Storage, StorageError, StorageResult};
use crate::sync::merkle_block::MerkleBlock;
use crate::sync::validator::{BlockValidationError, BlockValidatorChain};
use crate::transactions::TransactionInfoConverter;
use std::sync::Arc;

pub struct Blockchain {
    storage: Arc<dyn Storage>,
    validator: BlockValidatorChain,
    converter: Arc<TransactionInfoConverter>,
    events: Arc<EventDispatcher>,
}

impl Blockchain {
    pub fn new(
        storage: Arc<dyn Storage>,
        validator: BlockValidatorChain,
        converter: Arc<TransactionInfoConverter>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            storage,
            validator,
            converter,
            events,
        }
    }

    /// Validate and store a block extending a known one
    pub fn connect(&self, merkle_block: &MerkleBlock) -> Result<Block, BlockValidationError> {
        if let Some(existing) = self.storage.block(&merkle_block.header_hash)? {
            return Ok(existing);
        }

        let previous_hash = merkle_block.header.previous_block_hash;
        let previous = self
            .storage
            .block(&previous_hash)?
            .ok_or_else(|| BlockValidationError::NoPreviousBlock(previous_hash.to_hex()))?;

        let mut block = Block::with_previous(merkle_block.header.clone(), &previous);
        self.validator.validate(&block, &previous)?;
        block.stale = true;

        log::debug!("Connected block {} at height {}", block.header_hash, block.height);
        self.add_block(block.clone())?;
        Ok(block)
    }

    /// Store a block at a height trusted from elsewhere, unvalidated
    pub fn force_add(&self, merkle_block: &MerkleBlock, height: u32) -> StorageResult<Block> {
        let block = Block::new(merkle_block.header.clone(), height);
        self.add_block(block.clone())?;
        Ok(block)
    }

    fn add_block(&self, block: Block) -> StorageResult<()> {
        let info = BlockInfo::from(&block);
        self.storage.add_block(block)?;
        self.events.emit(KitEvent::LastBlockInfoUpdated(info));
        Ok(())
    }

    /// Keep the longer branch after a download iteration
    pub fn handle_fork(&self) -> StorageResult<()> {
        let stale = self.storage.blocks(true)?;
        let Some(first_stale) = stale.first() else {
            return Ok(());
        };
        let last_stale_height = stale.last().map_or(0, |b| b.height);

        let not_stale = self.storage.blocks(false)?;
        let last_not_stale_height = not_stale.last().map_or(0, |b| b.height);

        if last_stale_height > last_not_stale_height {
            let losing: Vec<Block> = not_stale
                .into_iter()
                .filter(|b| b.height >= first_stale.height)
                .collect();
            if !losing.is_empty() {
                log::info!(
                    "Fork found: replacing {} blocks from height {}",
                    losing.len(),
                    first_stale.height
                );
            }
            self.delete_blocks(&losing)?;
            self.storage.unstale_all_blocks()?;
        } else {
            log::info!("Dropping {} blocks of a shorter branch", stale.len());
            self.delete_blocks(&stale)?;
        }
        Ok(())
    }

    /// Remove blocks; the transactions they confirmed return to pending
    pub fn delete_blocks(&self, blocks: &[Block]) -> StorageResult<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut updated = Vec::new();
        for block in blocks {
            for mut tx in self.storage.transactions_of_block(&block.header_hash)? {
                tx.header.block_hash = None;
                tx.header.status = TransactionStatus::Relayed;
                self.storage.update_transaction(&tx.header)?;
                if tx.header.is_mine {
                    updated.push(self.converter.transaction_info(&tx)?);
                }
            }
        }

        let hashes: Vec<Hash256> = blocks.iter().map(|b| b.header_hash).collect();
        self.storage.delete_blocks(&hashes)?;

        if !updated.is_empty() {
            self.events.emit(KitEvent::TransactionsUpdated {
                inserted: Vec::new(),
                updated,
            });
        }
        if let Some(last) = self.storage.last_block()? {
            self.events.emit(KitEvent::LastBlockInfoUpdated(BlockInfo::from(&last)));
        }
        Ok(())
    }

    pub fn last_block(&self) -> Result<Option<Block>, StorageError> {
        self.storage.last_block()
    }
}
