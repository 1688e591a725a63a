//! Creating, storing and broadcasting outgoing transactions

use crate::bloom::BloomFilterManager;
use crate::core::FullTransaction;
use crate::storage::UnspentOutput;
use crate::transactions::builder::{BuildError, TransactionBuilder};
use crate::transactions::processor::{PendingTransactionProcessor, ProcessError};
use crate::transactions::sender::{TransactionSendError, TransactionSender};
use crate::transactions::sorter::TransactionDataSortType;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransactionCreationError {
    #[error("Transaction already exists")]
    AlreadyExists,
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Send(#[from] TransactionSendError),
    #[error("Processing failed: {0}")]
    Process(ProcessError),
}

impl From<ProcessError> for TransactionCreationError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::AlreadyExists => TransactionCreationError::AlreadyExists,
            other => TransactionCreationError::Process(other),
        }
    }
}

pub struct TransactionCreator {
    builder: Arc<TransactionBuilder>,
    processor: Arc<PendingTransactionProcessor>,
    sender: Arc<TransactionSender>,
    bloom_filter_manager: Arc<BloomFilterManager>,
}

impl TransactionCreator {
    pub fn new(
        builder: Arc<TransactionBuilder>,
        processor: Arc<PendingTransactionProcessor>,
        sender: Arc<TransactionSender>,
        bloom_filter_manager: Arc<BloomFilterManager>,
    ) -> Self {
        Self {
            builder,
            processor,
            sender,
            bloom_filter_manager,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        to_address: &str,
        value: u64,
        fee_rate: u64,
        sender_pay: bool,
        sort_type: TransactionDataSortType,
        plugin_data: Option<Vec<u8>>,
        zero_lock_time: bool,
    ) -> Result<FullTransaction, TransactionCreationError> {
        self.sender.verify_can_send()?;
        let tx = self.builder.build_transaction(
            to_address,
            value,
            fee_rate,
            sender_pay,
            sort_type,
            plugin_data,
            zero_lock_time,
        )?;
        self.process_and_send(tx)
    }

    /// Spend one specific output entirely
    pub fn create_from_unspent(
        &self,
        unspent: UnspentOutput,
        to_address: &str,
        fee_rate: u64,
        sort_type: TransactionDataSortType,
    ) -> Result<FullTransaction, TransactionCreationError> {
        self.sender.verify_can_send()?;
        let tx = self
            .builder
            .build_transaction_from_unspent(unspent, to_address, fee_rate, sort_type)?;
        self.process_and_send(tx)
    }

    fn process_and_send(&self, tx: FullTransaction) -> Result<FullTransaction, TransactionCreationError> {
        match self.processor.process_created(tx.clone()) {
            Ok(()) => {}
            Err(ProcessError::BloomFilterExpired) => {
                if let Err(e) = self.bloom_filter_manager.regenerate_bloom_filter() {
                    log::error!("Could not regenerate bloom filter: {}", e);
                }
            }
            Err(e) => return Err(e.into()),
        }
        self.sender.send(&tx)?;
        Ok(tx)
    }
}
