//! Header validation
//!
//! Every validator registered in a chain must accept a block before it
//! is connected.

use crate::core::network::{RETARGET_INTERVAL, TARGET_TIMESPAN};
use crate::core::{Block, Network};
use crate::crypto::{compact_to_target, target_to_compact};
use crate::storage::{Storage, StorageError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockValidationError {
    #[error("Previous block {0} is not known")]
    NoPreviousBlock(String),
    #[error("Block does not link to the previous header")]
    WrongPreviousHeader,
    #[error("Header hash does not meet its target")]
    InvalidProofOfWork,
    #[error("Bits {got:#010x} do not match expected {expected:#010x}")]
    NotEqualBits { expected: u32, got: u32 },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub trait BlockValidator: Send + Sync {
    /// `block` already carries its height; `previous` is the block it extends
    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidationError>;
}

// =============================================================================
// Validators
// =============================================================================

pub struct HeaderLinkValidator;

impl BlockValidator for HeaderLinkValidator {
    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidationError> {
        if block.header.previous_block_hash != previous.header_hash || block.height != previous.height + 1 {
            return Err(BlockValidationError::WrongPreviousHeader);
        }
        Ok(())
    }
}

pub struct ProofOfWorkValidator;

impl BlockValidator for ProofOfWorkValidator {
    fn validate(&self, block: &Block, _previous: &Block) -> Result<(), BlockValidationError> {
        if !block.header.has_valid_proof_of_work() {
            return Err(BlockValidationError::InvalidProofOfWork);
        }
        Ok(())
    }
}

/// Bits stay constant inside a retarget window and follow the timespan
/// rule on its boundary
pub struct DifficultyTransitionValidator {
    storage: Arc<dyn Storage>,
    max_target_bits: u32,
}

impl DifficultyTransitionValidator {
    pub fn new(storage: Arc<dyn Storage>, max_target_bits: u32) -> Self {
        Self {
            storage,
            max_target_bits,
        }
    }

    /// Retarget of `bits` after a window that took `actual_timespan` seconds
    pub fn retarget(bits: u32, actual_timespan: u32, max_target_bits: u32) -> u32 {
        let timespan = actual_timespan.clamp(TARGET_TIMESPAN / 4, TARGET_TIMESPAN * 4);
        let target = div_u32(&mul_u32(&compact_to_target(bits), timespan), TARGET_TIMESPAN);
        let max_target = compact_to_target(max_target_bits);
        if target > max_target {
            max_target_bits
        } else {
            target_to_compact(&target)
        }
    }
}

impl BlockValidator for DifficultyTransitionValidator {
    fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidationError> {
        let expected = if block.height % RETARGET_INTERVAL != 0 {
            previous.header.bits
        } else {
            let Some(first) = self.storage.block_by_height(block.height - RETARGET_INTERVAL)? else {
                // window started before our checkpoint
                return Ok(());
            };
            let actual = previous.header.timestamp.saturating_sub(first.header.timestamp);
            Self::retarget(previous.header.bits, actual, self.max_target_bits)
        };

        if block.header.bits != expected {
            return Err(BlockValidationError::NotEqualBits {
                expected,
                got: block.header.bits,
            });
        }
        Ok(())
    }
}

/// Big-endian 256-bit value times `factor`; overflow past 256 bits is dropped
fn mul_u32(value: &[u8; 32], factor: u32) -> [u8; 32] {
    let mut result = [0u8; 32];
    let mut carry = 0u64;
    for i in (0..32).rev() {
        let product = value[i] as u64 * factor as u64 + carry;
        result[i] = product as u8;
        carry = product >> 8;
    }
    result
}

fn div_u32(value: &[u8; 32], divisor: u32) -> [u8; 32] {
    let mut result = [0u8; 32];
    let mut remainder = 0u64;
    for i in 0..32 {
        let current = (remainder << 8) | value[i] as u64;
        result[i] = (current / divisor as u64) as u8;
        remainder = current % divisor as u64;
    }
    result
}

// =============================================================================
// Chain
// =============================================================================

/// Validators that must all pass
#[derive(Default)]
pub struct BlockValidatorChain {
    validators: Vec<Box<dyn BlockValidator>>,
}

impl BlockValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks enforced on `network`
    pub fn for_network(network: Network, storage: Arc<dyn Storage>) -> Self {
        let mut chain = Self::new();
        chain.add(Box::new(HeaderLinkValidator));
        if network.checks_proof_of_work() {
            chain.add(Box::new(ProofOfWorkValidator));
        }
        if network.checks_difficulty_transitions() {
            chain.add(Box::new(DifficultyTransitionValidator::new(
                storage,
                network.max_target_bits(),
            )));
        }
        chain
    }

    pub fn add(&mut self, validator: Box<dyn BlockValidator>) {
        self.validators.push(validator);
    }

    pub fn validate(&self, block: &Block, previous: &Block) -> Result<(), BlockValidationError> {
        self.validators
            .iter()
            .try_for_each(|validator| validator.validate(block, previous))
    }
}
