//! Spendable outputs and balance
//!
//! Recomputed from storage on every call; nothing is cached.

use crate::storage::{Storage, StorageError, UnspentOutput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wallet balance split by spendability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub spendable: u64,
    /// Incoming funds waiting for confirmations
    pub unspendable: u64,
}

pub struct UnspentOutputProvider {
    storage: Arc<dyn Storage>,
    confirmations_threshold: u32,
}

impl UnspentOutputProvider {
    pub fn new(storage: Arc<dyn Storage>, confirmations_threshold: u32) -> Self {
        Self {
            storage,
            confirmations_threshold,
        }
    }

    fn is_spendable(&self, unspent: &UnspentOutput, last_height: u32) -> bool {
        if unspent.output.plugin_id.is_some() {
            return false;
        }
        // our own change is trusted before confirmation
        if unspent.transaction.is_outgoing {
            return true;
        }
        match unspent.block_height {
            Some(height) => last_height + 1 >= height + self.confirmations_threshold,
            None => false,
        }
    }

    fn split(&self) -> Result<(Vec<UnspentOutput>, Vec<UnspentOutput>), StorageError> {
        let last_height = self.storage.last_block()?.map_or(0, |b| b.height);
        Ok(self
            .storage
            .unspent_outputs()?
            .into_iter()
            .partition(|u| self.is_spendable(u, last_height)))
    }

    /// Outputs confirmed deeply enough (or our own change)
    pub fn spendable_outputs(&self) -> Result<Vec<UnspentOutput>, StorageError> {
        Ok(self.split()?.0)
    }

    /// Every unspent wallet output, including unconfirmed incoming ones
    pub fn all_outputs(&self) -> Result<Vec<UnspentOutput>, StorageError> {
        self.storage.unspent_outputs()
    }

    pub fn balance(&self) -> Result<BalanceInfo, StorageError> {
        let (spendable, unspendable) = self.split()?;
        Ok(BalanceInfo {
            spendable: spendable.iter().map(|u| u.output.value).sum(),
            unspendable: unspendable.iter().map(|u| u.output.value).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash256;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{block_at, incoming_transaction, wallet_key};

    #[test]
    fn test_confirmations_threshold() {
        let storage = Arc::new(MemoryStorage::new());
        let key = wallet_key(0, true);
        storage.add_public_keys(vec![key.clone()]).unwrap();

        let block = block_at(10, Hash256::ZERO);
        let mut confirmed = incoming_transaction(&key, &[3_000]);
        confirmed.header.block_hash = Some(block.header_hash);
        storage.add_block(block).unwrap();
        storage.add_transaction(confirmed).unwrap();
        storage.add_transaction(incoming_transaction(&key, &[500])).unwrap();

        let provider = UnspentOutputProvider::new(storage.clone(), 2);
        assert_eq!(
            provider.balance().unwrap(),
            BalanceInfo {
                spendable: 0,
                unspendable: 3_500
            }
        );

        storage.add_block(block_at(11, Hash256::ZERO)).unwrap();
        assert_eq!(provider.balance().unwrap().spendable, 3_000);
        assert_eq!(provider.spendable_outputs().unwrap().len(), 1);
        assert_eq!(provider.all_outputs().unwrap().len(), 2);
    }

    #[test]
    fn test_own_change_is_spendable_unconfirmed() {
        let storage = Arc::new(MemoryStorage::new());
        let key = wallet_key(0, false);
        storage.add_public_keys(vec![key.clone()]).unwrap();

        let mut change = incoming_transaction(&key, &[9_000]);
        change.header.is_outgoing = true;
        storage.add_transaction(change).unwrap();

        let provider = UnspentOutputProvider::new(storage, 6);
        assert_eq!(provider.balance().unwrap().spendable, 9_000);
    }
}
