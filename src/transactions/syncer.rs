//! Relayed transactions and the local send queue

use crate::bloom::BloomFilterManager;
use crate::core::FullTransaction;
use crate::crypto::Hash256;
use crate::storage::{Storage, StorageResult};
use crate::transactions::conflicts::TransactionInvalidator;
use crate::transactions::processor::{PendingTransactionProcessor, ProcessError};
use std::sync::Arc;

pub struct TransactionSyncer {
    storage: Arc<dyn Storage>,
    processor: Arc<PendingTransactionProcessor>,
    invalidator: Arc<TransactionInvalidator>,
    bloom_filter_manager: Arc<BloomFilterManager>,
}

impl TransactionSyncer {
    pub fn new(
        storage: Arc<dyn Storage>,
        processor: Arc<PendingTransactionProcessor>,
        invalidator: Arc<TransactionInvalidator>,
        bloom_filter_manager: Arc<BloomFilterManager>,
    ) -> Self {
        Self {
            storage,
            processor,
            invalidator,
            bloom_filter_manager,
        }
    }

    /// Created locally and not yet relayed back by any peer
    pub fn pending_transactions(&self) -> StorageResult<Vec<FullTransaction>> {
        self.storage.new_transactions()
    }

    /// Unconfirmed transactions delivered by peers
    pub fn handle_relayed(&self, transactions: Vec<FullTransaction>) -> Result<(), ProcessError> {
        if transactions.is_empty() {
            return Ok(());
        }
        match self.processor.process_received(transactions, false) {
            Err(ProcessError::BloomFilterExpired) => {
                if let Err(e) = self.bloom_filter_manager.regenerate_bloom_filter() {
                    log::error!("Could not regenerate bloom filter: {}", e);
                }
                Ok(())
            }
            other => other,
        }
    }

    /// Give up on a transaction the network did not take
    pub fn handle_invalid(&self, hash: &Hash256) -> StorageResult<()> {
        if let Some(tx) = self.storage.full_transaction(hash)? {
            self.invalidator.invalidate(tx)?;
        }
        self.storage.delete_sent_transaction(hash)
    }

    pub fn should_request_transaction(&self, hash: &Hash256) -> StorageResult<bool> {
        Ok(self.storage.transaction(hash)?.is_none() && self.storage.invalid_transaction(hash)?.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionStatus;
    use crate::storage::{MemoryStorage, SentTransaction};
    use crate::test_utils::{foreign_transaction, incoming_transaction, pending_pipeline, storage_with_keys};

    fn syncer(storage: Arc<MemoryStorage>, gap_limit: u32) -> TransactionSyncer {
        let pipeline = pending_pipeline(storage.clone(), gap_limit);
        TransactionSyncer::new(storage, pipeline.processor, pipeline.invalidator, pipeline.bloom)
    }

    #[test]
    fn test_relayed_transactions() {
        let storage = storage_with_keys(2);
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let syncer = syncer(storage.clone(), 2);

        let mine = incoming_transaction(&key, &[3_000]);
        let foreign = foreign_transaction(&[], 1);
        assert!(syncer.should_request_transaction(&mine.hash()).unwrap());

        syncer.handle_relayed(vec![mine.clone(), foreign.clone()]).unwrap();
        let stored = storage.transaction(&mine.hash()).unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Relayed);
        assert!(storage.transaction(&foreign.hash()).unwrap().is_none());

        assert!(!syncer.should_request_transaction(&mine.hash()).unwrap());
        assert!(syncer.should_request_transaction(&foreign.hash()).unwrap());
        assert!(syncer.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_expired_filter_is_regenerated() {
        let storage = Arc::new(MemoryStorage::new());
        let syncer = syncer(storage.clone(), 2);
        syncer.bloom_filter_manager.regenerate_bloom_filter().unwrap();
        let key = storage.public_key("0/0/1").unwrap().unwrap();

        syncer.handle_relayed(vec![incoming_transaction(&key, &[1_000])]).unwrap();
        assert!(storage.public_key("0/0/3").unwrap().is_some());
    }

    #[test]
    fn test_invalid_transaction_abandoned() {
        let storage = storage_with_keys(1);
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let syncer = syncer(storage.clone(), 1);

        let tx = incoming_transaction(&key, &[2_000]);
        storage.add_transaction(tx.clone()).unwrap();
        storage.save_sent_transaction(SentTransaction::new(tx.hash(), 100)).unwrap();

        syncer.handle_invalid(&tx.hash()).unwrap();
        assert!(storage.transaction(&tx.hash()).unwrap().is_none());
        assert!(storage.invalid_transaction(&tx.hash()).unwrap().is_some());
        assert!(storage.sent_transaction(&tx.hash()).unwrap().is_none());
        assert!(!syncer.should_request_transaction(&tx.hash()).unwrap());
    }
}
