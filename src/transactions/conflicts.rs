//! Double-spend detection and invalidation

use crate::core::{FullTransaction, TransactionStatus};
use crate::crypto::Hash256;
use crate::events::{EventDispatcher, KitEvent};
use crate::storage::{InvalidTransaction, Storage, StorageError, StorageResult};
use crate::transactions::info::TransactionInfoConverter;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Finds stored transactions spending an outpoint `tx` also spends
pub struct TransactionConflictsResolver {
    storage: Arc<dyn Storage>,
}

impl TransactionConflictsResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn conflicting_transactions(&self, tx: &FullTransaction) -> StorageResult<Vec<FullTransaction>> {
        let hash = tx.hash();
        let mut seen = HashSet::new();
        let mut conflicts = Vec::new();

        for input in &tx.inputs {
            for spender in self.storage.inputs_spending(&input.previous_output)? {
                if spender.transaction_hash == hash || !seen.insert(spender.transaction_hash) {
                    continue;
                }
                if let Some(conflicting) = self.storage.full_transaction(&spender.transaction_hash)? {
                    conflicts.push(conflicting);
                }
            }
        }
        Ok(conflicts)
    }

    /// A pending transaction loses to a confirmed double-spend
    pub fn is_ignored_pending(&self, conflicts: &[FullTransaction]) -> bool {
        conflicts.iter().any(|c| c.header.block_hash.is_some())
    }

    /// Pending transactions a confirmed `tx` makes impossible
    pub fn pending_conflicts_of_confirmed(
        &self,
        tx: &FullTransaction,
    ) -> StorageResult<Vec<FullTransaction>> {
        Ok(self
            .conflicting_transactions(tx)?
            .into_iter()
            .filter(|c| c.header.is_pending())
            .collect())
    }
}

/// Moves transactions and their pending descendants to the invalid set
pub struct TransactionInvalidator {
    storage: Arc<dyn Storage>,
    converter: Arc<TransactionInfoConverter>,
    events: Arc<EventDispatcher>,
}

impl TransactionInvalidator {
    pub fn new(
        storage: Arc<dyn Storage>,
        converter: Arc<TransactionInfoConverter>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            storage,
            converter,
            events,
        }
    }

    /// `root` and every pending transaction spending its outputs, recursively
    fn with_descendants(&self, root: FullTransaction) -> StorageResult<Vec<FullTransaction>> {
        let mut seen = HashSet::from([root.hash()]);
        let mut queue = VecDeque::from([root]);
        let mut collected = Vec::new();

        while let Some(tx) = queue.pop_front() {
            for output in &tx.outputs {
                for spender in self.storage.inputs_spending(&output.outpoint())? {
                    if !seen.insert(spender.transaction_hash) {
                        continue;
                    }
                    if let Some(child) = self.storage.full_transaction(&spender.transaction_hash)? {
                        if child.header.is_pending() {
                            queue.push_back(child);
                        }
                    }
                }
            }
            collected.push(tx);
        }
        Ok(collected)
    }

    pub fn invalidate(&self, tx: FullTransaction) -> StorageResult<()> {
        let transactions = self.with_descendants(tx)?;
        let invalidated: HashSet<Hash256> = transactions.iter().map(|t| t.hash()).collect();

        let mut infos = Vec::with_capacity(transactions.len());
        let mut records = Vec::with_capacity(transactions.len());
        let mut failed_spends = Vec::new();

        for mut tx in transactions {
            tx.header.status = TransactionStatus::Invalid;
            let info = self.converter.transaction_info(&tx)?;
            let json = serde_json::to_string(&info).map_err(StorageError::from)?;

            if tx.header.is_outgoing {
                failed_spends.extend(
                    tx.inputs
                        .iter()
                        .map(|i| i.previous_output)
                        .filter(|p| !invalidated.contains(&p.hash)),
                );
            }
            log::info!("Invalidating transaction {}", tx.header.data_hash);
            infos.push(info);
            records.push(InvalidTransaction {
                transaction: tx,
                transaction_info_json: json,
            });
        }

        self.storage.move_to_invalid(records)?;

        for outpoint in failed_spends {
            if let Some(mut output) = self.storage.output(&outpoint)? {
                if output.is_mine() {
                    output.failed_to_spend = true;
                    self.storage.update_output(&output)?;
                }
            }
        }

        self.events.emit(KitEvent::TransactionsUpdated {
            inserted: Vec::new(),
            updated: infos,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutPoint;
    use crate::test_utils::{foreign_transaction, incoming_transaction, spending_transaction, storage_with_keys};

    #[test]
    fn test_conflicting_transactions() {
        let storage = storage_with_keys(1);
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let funding = incoming_transaction(&key, &[10_000]);
        let outpoint = funding.outputs[0].outpoint();
        storage.add_transaction(funding).unwrap();

        let first = spending_transaction(&[outpoint], 9_000);
        storage.add_transaction(first.clone()).unwrap();
        let second = spending_transaction(&[outpoint], 8_000);

        let resolver = TransactionConflictsResolver::new(storage.clone());
        let conflicts = resolver.conflicting_transactions(&second).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].hash(), first.hash());
        assert!(!resolver.is_ignored_pending(&conflicts));
        assert_eq!(resolver.pending_conflicts_of_confirmed(&second).unwrap().len(), 1);

        // itself is no conflict
        assert!(resolver.conflicting_transactions(&first).unwrap().is_empty());
    }

    #[test]
    fn test_invalidate_with_descendants() {
        let storage = storage_with_keys(1);
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let funding = incoming_transaction(&key, &[10_000]);
        let outpoint = funding.outputs[0].outpoint();
        storage.add_transaction(funding).unwrap();

        let mut parent = spending_transaction(&[outpoint], 9_000);
        parent.header.is_outgoing = true;
        parent.header.is_mine = true;
        storage.add_transaction(parent.clone()).unwrap();
        let child = foreign_transaction(&[OutPoint::new(parent.hash(), 0)], 1);
        storage.add_transaction(child.clone()).unwrap();

        let events = Arc::new(EventDispatcher::new());
        let mut subscription = events.subscribe();
        let converter = Arc::new(TransactionInfoConverter::new(storage.clone()));
        TransactionInvalidator::new(storage.clone(), converter, events)
            .invalidate(parent.clone())
            .unwrap();

        assert!(storage.transaction(&parent.hash()).unwrap().is_none());
        assert!(storage.transaction(&child.hash()).unwrap().is_none());
        let invalid = storage.invalid_transaction(&parent.hash()).unwrap().unwrap();
        assert_eq!(invalid.transaction.header.status, TransactionStatus::Invalid);
        assert!(invalid.transaction_info_json.contains("\"invalid\""));
        assert!(storage.invalid_transaction(&child.hash()).unwrap().is_some());

        let funding_output = storage.output(&outpoint).unwrap().unwrap();
        assert!(funding_output.failed_to_spend);

        match subscription.try_recv() {
            Some(KitEvent::TransactionsUpdated { inserted, updated }) => {
                assert!(inserted.is_empty());
                assert_eq!(updated.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
