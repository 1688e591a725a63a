//! Applying received and created transactions to storage
//!
//! Both processors extract, link and store transactions, then report
//! one event per batch. A batch is processed in spend-dependency order.

use crate::bloom::IrregularOutputsProvider;
use crate::core::{Block, FullTransaction, TransactionStatus};
use crate::crypto::Hash256;
use crate::events::{EventDispatcher, KitEvent};
use crate::storage::{Storage, StorageError};
use crate::transactions::conflicts::{TransactionConflictsResolver, TransactionInvalidator};
use crate::transactions::extractor::TransactionExtractor;
use crate::transactions::info::{TransactionInfo, TransactionInfoConverter};
use crate::transactions::watched::WatchedTransactionManager;
use crate::wallet::{PublicKeyManager, PublicKeyManagerError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    /// The filter no longer covers the wallet; everything was still stored
    #[error("Bloom filter expired")]
    BloomFilterExpired,
    #[error("Transaction already exists")]
    AlreadyExists,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Public key error: {0}")]
    PublicKeys(#[from] PublicKeyManagerError),
}

/// Parents before children, otherwise arrival order
pub fn topological_order(transactions: Vec<FullTransaction>) -> Vec<FullTransaction> {
    let position: HashMap<Hash256, usize> = transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| (tx.hash(), i))
        .collect();

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); transactions.len()];
    let mut in_degree = vec![0usize; transactions.len()];
    for (child, tx) in transactions.iter().enumerate() {
        let mut parents: Vec<usize> = tx
            .inputs
            .iter()
            .filter_map(|i| position.get(&i.previous_output.hash).copied())
            .filter(|parent| *parent != child)
            .collect();
        parents.sort_unstable();
        parents.dedup();
        for parent in parents {
            children[parent].push(child);
            in_degree[child] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..transactions.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(transactions.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for child in &children[next] {
            in_degree[*child] -= 1;
            if in_degree[*child] == 0 {
                ready.insert(*child);
            }
        }
    }
    // only reachable with a spend cycle
    if order.len() < transactions.len() {
        let placed: BTreeSet<usize> = order.iter().copied().collect();
        order.extend((0..transactions.len()).filter(|i| !placed.contains(i)));
    }

    let mut slots: Vec<Option<FullTransaction>> = transactions.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Shared collaborators of both processors
struct Pipeline {
    storage: Arc<dyn Storage>,
    extractor: Arc<TransactionExtractor>,
    public_key_manager: Arc<PublicKeyManager>,
    converter: Arc<TransactionInfoConverter>,
    watched: Arc<WatchedTransactionManager>,
    events: Arc<EventDispatcher>,
}

impl Pipeline {
    fn info(&self, tx: &FullTransaction) -> Result<TransactionInfo, ProcessError> {
        Ok(self.converter.transaction_info(tx)?)
    }

    fn info_of(&self, hash: &Hash256) -> Result<Option<TransactionInfo>, ProcessError> {
        match self.storage.full_transaction(hash)? {
            Some(tx) => Ok(Some(self.info(&tx)?)),
            None => Ok(None),
        }
    }

    fn needs_new_filter(&self, tx: &FullTransaction) -> Result<bool, ProcessError> {
        Ok(IrregularOutputsProvider::has_irregular_output(tx) || self.public_key_manager.gap_shifts()?)
    }

    fn emit(&self, inserted: Vec<TransactionInfo>, updated: Vec<TransactionInfo>) {
        if !inserted.is_empty() || !updated.is_empty() {
            self.events.emit(KitEvent::TransactionsUpdated { inserted, updated });
        }
    }
}

// =============================================================================
// Pending
// =============================================================================

pub struct PendingTransactionProcessor {
    pipeline: Pipeline,
    resolver: TransactionConflictsResolver,
}

impl PendingTransactionProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        extractor: Arc<TransactionExtractor>,
        public_key_manager: Arc<PublicKeyManager>,
        converter: Arc<TransactionInfoConverter>,
        watched: Arc<WatchedTransactionManager>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            resolver: TransactionConflictsResolver::new(storage.clone()),
            pipeline: Pipeline {
                storage,
                extractor,
                public_key_manager,
                converter,
                watched,
                events,
            },
        }
    }

    /// Unconfirmed transactions relayed by peers
    pub fn process_received(
        &self,
        transactions: Vec<FullTransaction>,
        skip_check_bloom_filter: bool,
    ) -> Result<(), ProcessError> {
        let p = &self.pipeline;
        let mut inserted = Vec::new();
        let mut updated = Vec::new();
        let mut filter_expired = false;

        for (order, mut tx) in topological_order(transactions).into_iter().enumerate() {
            let hash = tx.hash();
            if let Some(mut existing) = p.storage.transaction(&hash)? {
                if existing.status == TransactionStatus::New {
                    existing.status = TransactionStatus::Relayed;
                    p.storage.update_transaction(&existing)?;
                    updated.extend(p.info_of(&hash)?);
                }
                continue;
            }
            if p.storage.invalid_transaction(&hash)?.is_some() {
                continue;
            }

            p.extractor.extract(&mut tx)?;
            p.watched.check(&tx);
            if !tx.header.is_mine {
                continue;
            }

            let conflicts = self.resolver.conflicting_transactions(&tx)?;
            if self.resolver.is_ignored_pending(&conflicts) {
                log::info!("Ignoring {}: conflicts with a confirmed transaction", hash);
                continue;
            }

            tx.header.status = TransactionStatus::Relayed;
            tx.header.order = order as u32;
            p.storage.add_transaction(tx.clone())?;

            for mut conflicting in conflicts {
                log::info!("Transaction {} double-spends {}", hash, conflicting.hash());
                conflicting.header.conflicting_tx_hash = Some(hash);
                p.storage.update_transaction(&conflicting.header)?;
                updated.push(p.info(&conflicting)?);
            }
            inserted.push(p.info(&tx)?);

            if !skip_check_bloom_filter && !filter_expired {
                filter_expired = p.needs_new_filter(&tx)?;
            }
        }

        p.emit(inserted, updated);
        if filter_expired {
            return Err(ProcessError::BloomFilterExpired);
        }
        Ok(())
    }

    /// A transaction built and signed locally
    pub fn process_created(&self, mut tx: FullTransaction) -> Result<(), ProcessError> {
        let p = &self.pipeline;
        if p.storage.transaction(&tx.hash())?.is_some() {
            return Err(ProcessError::AlreadyExists);
        }

        p.extractor.extract(&mut tx)?;
        tx.header.status = TransactionStatus::New;
        p.storage.add_transaction(tx.clone())?;
        p.emit(vec![p.info(&tx)?], Vec::new());

        if p.needs_new_filter(&tx)? {
            return Err(ProcessError::BloomFilterExpired);
        }
        Ok(())
    }
}

// =============================================================================
// Block
// =============================================================================

pub struct BlockTransactionProcessor {
    pipeline: Pipeline,
    resolver: TransactionConflictsResolver,
    invalidator: Arc<TransactionInvalidator>,
}

impl BlockTransactionProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        extractor: Arc<TransactionExtractor>,
        public_key_manager: Arc<PublicKeyManager>,
        converter: Arc<TransactionInfoConverter>,
        watched: Arc<WatchedTransactionManager>,
        invalidator: Arc<TransactionInvalidator>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            resolver: TransactionConflictsResolver::new(storage.clone()),
            invalidator,
            pipeline: Pipeline {
                storage,
                extractor,
                public_key_manager,
                converter,
                watched,
                events,
            },
        }
    }

    /// Transactions matched in `block`; every stored transaction among
    /// them becomes confirmed by it
    pub fn process_received(
        &self,
        transactions: Vec<FullTransaction>,
        block: &Block,
        skip_check_bloom_filter: bool,
    ) -> Result<(), ProcessError> {
        let p = &self.pipeline;
        let mut inserted = Vec::new();
        let mut updated = Vec::new();
        let mut filter_expired = false;

        for (order, mut tx) in topological_order(transactions).into_iter().enumerate() {
            let hash = tx.hash();
            if let Some(existing) = p.storage.full_transaction(&hash)? {
                for conflicting in self.resolver.pending_conflicts_of_confirmed(&existing)? {
                    log::info!("Confirmed {} invalidates {}", hash, conflicting.hash());
                    self.invalidator.invalidate(conflicting)?;
                }

                let mut header = existing.header;
                let unchanged = header.block_hash == Some(block.header_hash)
                    && header.status == TransactionStatus::Relayed
                    && header.order == order as u32
                    && header.conflicting_tx_hash.is_none();
                if unchanged {
                    continue;
                }
                header.block_hash = Some(block.header_hash);
                header.status = TransactionStatus::Relayed;
                header.order = order as u32;
                header.conflicting_tx_hash = None;
                p.storage.update_transaction(&header)?;
                updated.extend(p.info_of(&hash)?);
                continue;
            }

            p.extractor.extract(&mut tx)?;
            p.watched.check(&tx);
            if !tx.header.is_mine {
                continue;
            }

            // a once-invalidated transaction that got mined after all
            if p.storage.invalid_transaction(&hash)?.is_some() {
                log::info!("Invalidated transaction {} was confirmed", hash);
                p.storage.delete_invalid_transaction(&hash)?;
            }

            for conflicting in self.resolver.pending_conflicts_of_confirmed(&tx)? {
                log::info!("Confirmed {} invalidates {}", hash, conflicting.hash());
                self.invalidator.invalidate(conflicting)?;
            }

            tx.header.block_hash = Some(block.header_hash);
            tx.header.status = TransactionStatus::Relayed;
            tx.header.order = order as u32;
            p.storage.add_transaction(tx.clone())?;
            inserted.push(p.info(&tx)?);

            if !skip_check_bloom_filter && !filter_expired {
                filter_expired = p.needs_new_filter(&tx)?;
            }
        }

        p.emit(inserted, updated);
        if filter_expired {
            return Err(ProcessError::BloomFilterExpired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AddressConverterChain, Network, OutPoint};
    use crate::events::Subscription;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{block_at, p2pkh_output_to, spending_transaction, test_deriver};
    use crate::core::{Input, Output, PublicKey, Transaction, SEQUENCE_FINAL};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        pending: PendingTransactionProcessor,
        block: BlockTransactionProcessor,
        subscription: Subscription,
        key: PublicKey,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(EventDispatcher::new());
        let pkm = Arc::new(PublicKeyManager::new(storage.clone(), test_deriver(), 2));
        pkm.fill_gap().unwrap();
        let extractor = Arc::new(TransactionExtractor::new(
            storage.clone(),
            Arc::new(AddressConverterChain::for_network(Network::Regtest)),
        ));
        let converter = Arc::new(TransactionInfoConverter::new(storage.clone()));
        let watched = Arc::new(WatchedTransactionManager::new(events.clone()));
        let invalidator = Arc::new(TransactionInvalidator::new(
            storage.clone(),
            converter.clone(),
            events.clone(),
        ));
        let subscription = events.subscribe();
        let key = storage.public_key("0/0/0").unwrap().unwrap();

        Fixture {
            pending: PendingTransactionProcessor::new(
                storage.clone(),
                extractor.clone(),
                pkm.clone(),
                converter.clone(),
                watched.clone(),
                events.clone(),
            ),
            block: BlockTransactionProcessor::new(
                storage.clone(),
                extractor,
                pkm,
                converter,
                watched,
                invalidator,
                events,
            ),
            storage,
            subscription,
            key,
        }
    }

    /// Raw form, as it would arrive from a peer
    fn raw(tx: &FullTransaction) -> FullTransaction {
        FullTransaction::deserialize(&tx.serialize()).unwrap()
    }

    fn paying(key: &PublicKey, parents: &[OutPoint], values: &[u64]) -> FullTransaction {
        let inputs = if parents.is_empty() {
            vec![Input::new(OutPoint::new(Hash256::digest(b"coinbase"), 0), vec![0x51], SEQUENCE_FINAL)]
        } else {
            parents.iter().map(|p| Input::new(*p, vec![0x51], SEQUENCE_FINAL)).collect()
        };
        let outputs: Vec<Output> = values
            .iter()
            .enumerate()
            .map(|(i, v)| p2pkh_output_to(key, *v, i as u32))
            .collect();
        raw(&FullTransaction::new(Transaction::default(), inputs, outputs))
    }

    fn next_update(subscription: &mut Subscription) -> (Vec<TransactionInfo>, Vec<TransactionInfo>) {
        loop {
            match subscription.try_recv() {
                Some(KitEvent::TransactionsUpdated { inserted, updated }) => return (inserted, updated),
                Some(_) => continue,
                None => panic!("no transactions event"),
            }
        }
    }

    #[test]
    fn test_batch_processed_in_dependency_order() {
        let mut f = fixture();
        let tx1 = paying(&f.key, &[], &[10_000, 10_000]);
        let tx2 = paying(&f.key, &[OutPoint::new(tx1.hash(), 0)], &[9_000]);
        let tx3 = paying(&f.key, &[OutPoint::new(tx1.hash(), 1)], &[9_000]);
        let tx4 = paying(
            &f.key,
            &[OutPoint::new(tx2.hash(), 0), OutPoint::new(tx3.hash(), 0)],
            &[17_000],
        );

        let batch = vec![tx4.clone(), tx3.clone(), tx1.clone(), tx2.clone()];
        let _ = f.pending.process_received(batch, true);

        let (inserted, updated) = next_update(&mut f.subscription);
        assert!(updated.is_empty());
        let order: Vec<String> = inserted.iter().map(|i| i.transaction_hash.clone()).collect();
        let expected: Vec<String> = [&tx1, &tx3, &tx2, &tx4].iter().map(|t| t.hash().to_hex()).collect();
        assert_eq!(order, expected);
        assert!(f.subscription.try_recv().is_none());

        // tx4 spends wallet outputs: outgoing with a known fee
        let stored = f.storage.full_transaction(&tx4.hash()).unwrap().unwrap();
        assert!(stored.header.is_outgoing);
        assert_eq!(stored.metadata.fee, Some(1_000));
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let mut f = fixture();
        let tx = paying(&f.key, &[], &[5_000]);
        let _ = f.pending.process_received(vec![tx.clone()], true);
        let (inserted, _) = next_update(&mut f.subscription);
        assert_eq!(inserted.len(), 1);

        f.pending.process_received(vec![tx.clone()], true).unwrap();
        assert!(f.subscription.try_recv().is_none());
        assert_eq!(f.storage.full_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_created_then_relayed() {
        let mut f = fixture();
        let tx = paying(&f.key, &[], &[5_000]);
        let _ = f.pending.process_created(tx.clone());
        let stored = f.storage.transaction(&tx.hash()).unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::New);
        next_update(&mut f.subscription);

        assert!(matches!(
            f.pending.process_created(tx.clone()),
            Err(ProcessError::AlreadyExists)
        ));

        f.pending.process_received(vec![tx.clone()], true).unwrap();
        let (inserted, updated) = next_update(&mut f.subscription);
        assert!(inserted.is_empty());
        assert_eq!(updated[0].status, TransactionStatus::Relayed);
    }

    #[test]
    fn test_foreign_transaction_not_stored() {
        let mut f = fixture();
        let tx = raw(&spending_transaction(&[OutPoint::new(Hash256::digest(b"x"), 0)], 100));
        f.pending.process_received(vec![tx.clone()], false).unwrap();
        assert!(f.storage.transaction(&tx.hash()).unwrap().is_none());
        assert!(f.subscription.try_recv().is_none());
    }

    #[test]
    fn test_key_usage_expires_filter() {
        let f = fixture();
        let tx = paying(&f.key, &[], &[5_000]);
        // the gap of 2 shrinks once key 0 is used
        assert!(matches!(
            f.pending.process_received(vec![tx.clone()], false),
            Err(ProcessError::BloomFilterExpired)
        ));
        assert!(f.storage.transaction(&tx.hash()).unwrap().is_some());
    }

    #[test]
    fn test_pending_double_spend_marks_older() {
        let mut f = fixture();
        let funding = paying(&f.key, &[], &[10_000]);
        let outpoint = OutPoint::new(funding.hash(), 0);
        let first = paying(&f.key, &[outpoint], &[9_000]);
        let second = paying(&f.key, &[outpoint], &[8_000]);

        let _ = f.pending.process_received(vec![funding, first.clone()], true);
        next_update(&mut f.subscription);
        f.pending.process_received(vec![second.clone()], true).unwrap();

        let (inserted, updated) = next_update(&mut f.subscription);
        assert_eq!(inserted[0].transaction_hash, second.hash().to_hex());
        assert_eq!(updated[0].conflicting_hash, Some(second.hash().to_hex()));
        let older = f.storage.transaction(&first.hash()).unwrap().unwrap();
        assert_eq!(older.conflicting_tx_hash, Some(second.hash()));
    }

    #[test]
    fn test_pending_conflicting_with_confirmed_is_ignored() {
        let f = fixture();
        let funding = paying(&f.key, &[], &[10_000]);
        let outpoint = OutPoint::new(funding.hash(), 0);
        let confirmed = paying(&f.key, &[outpoint], &[9_000]);
        let block = block_at(1, Hash256::ZERO);
        f.storage.add_block(block.clone()).unwrap();

        let _ = f.block.process_received(vec![funding, confirmed], &block, true);
        let late = paying(&f.key, &[outpoint], &[8_000]);
        f.pending.process_received(vec![late.clone()], true).unwrap();
        assert!(f.storage.transaction(&late.hash()).unwrap().is_none());
    }

    #[test]
    fn test_block_confirms_and_invalidates_conflicts() {
        let mut f = fixture();
        let funding = paying(&f.key, &[], &[10_000]);
        let outpoint = OutPoint::new(funding.hash(), 0);
        let loser = paying(&f.key, &[outpoint], &[9_000]);
        let winner = paying(&f.key, &[outpoint], &[8_500]);

        let _ = f.pending.process_received(vec![funding.clone(), loser.clone()], true);
        next_update(&mut f.subscription);

        let block = block_at(5, Hash256::ZERO);
        f.storage.add_block(block.clone()).unwrap();
        f.block
            .process_received(vec![funding.clone(), winner.clone()], &block, true)
            .unwrap();

        let (_, invalidated) = next_update(&mut f.subscription);
        assert_eq!(invalidated[0].status, TransactionStatus::Invalid);
        assert!(f.storage.invalid_transaction(&loser.hash()).unwrap().is_some());

        let (inserted, updated) = next_update(&mut f.subscription);
        assert_eq!(updated[0].block_height, Some(5));
        assert_eq!(inserted[0].transaction_hash, winner.hash().to_hex());
        let stored = f.storage.transaction(&winner.hash()).unwrap().unwrap();
        assert_eq!(stored.block_hash, Some(block.header_hash));
        assert_eq!(stored.order, 1);
    }

    #[test]
    fn test_confirming_known_transaction_invalidates_pending_double_spend() {
        let mut f = fixture();
        let funding = paying(&f.key, &[], &[10_000]);
        let outpoint = OutPoint::new(funding.hash(), 0);
        let first = paying(&f.key, &[outpoint], &[9_000]);
        let second = paying(&f.key, &[outpoint], &[8_000]);

        let _ = f.pending.process_received(vec![funding.clone(), first.clone()], true);
        next_update(&mut f.subscription);
        f.pending.process_received(vec![second.clone()], true).unwrap();
        next_update(&mut f.subscription);

        let block = block_at(3, Hash256::ZERO);
        f.storage.add_block(block.clone()).unwrap();
        f.block
            .process_received(vec![funding.clone(), first.clone()], &block, true)
            .unwrap();

        let (_, invalidated) = next_update(&mut f.subscription);
        assert_eq!(invalidated[0].transaction_hash, second.hash().to_hex());
        assert_eq!(invalidated[0].status, TransactionStatus::Invalid);
        assert!(f.storage.transaction(&second.hash()).unwrap().is_none());
        assert!(f.storage.invalid_transaction(&second.hash()).unwrap().is_some());

        let (inserted, updated) = next_update(&mut f.subscription);
        assert!(inserted.is_empty());
        assert_eq!(updated.len(), 2);
        let confirmed = f.storage.transaction(&first.hash()).unwrap().unwrap();
        assert_eq!(confirmed.block_hash, Some(block.header_hash));
        assert_eq!(confirmed.conflicting_tx_hash, None);
    }

    #[test]
    fn test_reprocessing_same_block_emits_nothing() {
        let mut f = fixture();
        let funding = paying(&f.key, &[], &[10_000]);
        let spend = paying(&f.key, &[OutPoint::new(funding.hash(), 0)], &[9_000]);
        let block = block_at(2, Hash256::ZERO);
        f.storage.add_block(block.clone()).unwrap();

        let _ = f
            .block
            .process_received(vec![funding.clone(), spend.clone()], &block, true);
        let (inserted, _) = next_update(&mut f.subscription);
        assert_eq!(inserted.len(), 2);
        while f.subscription.try_recv().is_some() {}

        f.block
            .process_received(vec![funding.clone(), spend.clone()], &block, true)
            .unwrap();
        assert!(f.subscription.try_recv().is_none());
        let stored = f.storage.transaction(&spend.hash()).unwrap().unwrap();
        assert_eq!(stored.order, 1);
        assert_eq!(f.storage.full_transactions().unwrap().len(), 2);
    }

    #[test]
    fn test_topological_order_keeps_unrelated_arrival_order() {
        let a = spending_transaction(&[OutPoint::new(Hash256::digest(b"a"), 0)], 1);
        let b = spending_transaction(&[OutPoint::new(Hash256::digest(b"b"), 0)], 2);
        let child = spending_transaction(&[OutPoint::new(b.hash(), 0)], 3);
        let sorted = topological_order(vec![child.clone(), a.clone(), b.clone()]);
        let hashes: Vec<_> = sorted.iter().map(|t| t.hash()).collect();
        assert_eq!(hashes, vec![a.hash(), b.hash(), child.hash()]);
    }
}
