//! Element sources of the wallet bloom filter

use crate::bloom::manager::BloomFilterError;
use crate::core::FullTransaction;
use crate::storage::Storage;
use crate::wallet::PublicKeyManager;
use std::sync::Arc;

/// Contributes elements the filter must match
pub trait BloomFilterProvider: Send + Sync {
    fn filter_elements(&self) -> Result<Vec<Vec<u8>>, BloomFilterError>;
}

/// Every wallet key as raw bytes, key hash and P2WPKH script hash. The
/// gap is filled first so the filter always covers `gap_limit` unused keys.
impl BloomFilterProvider for PublicKeyManager {
    fn filter_elements(&self) -> Result<Vec<Vec<u8>>, BloomFilterError> {
        self.fill_gap()?;
        Ok(self
            .public_keys()?
            .into_iter()
            .flat_map(|key| [key.raw, key.key_hash, key.script_hash_for_p2wpkh])
            .collect())
    }
}

/// Outpoints of wallet outputs in unconfirmed transactions, so spends of
/// them relay even before the key usage is visible to peers
pub struct PendingOutpointsProvider {
    storage: Arc<dyn Storage>,
}

impl PendingOutpointsProvider {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl BloomFilterProvider for PendingOutpointsProvider {
    fn filter_elements(&self) -> Result<Vec<Vec<u8>>, BloomFilterError> {
        Ok(self
            .storage
            .pending_transactions()?
            .iter()
            .flat_map(|tx| tx.outputs.iter().filter(|o| o.is_mine()))
            .map(|o| o.outpoint().serialize())
            .collect())
    }
}

/// Outpoints of unspent outputs whose spends carry no matchable key push
pub struct IrregularOutputsProvider {
    storage: Arc<dyn Storage>,
}

impl IrregularOutputsProvider {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// The filter must be rebuilt to catch spends of this transaction
    pub fn has_irregular_output(tx: &FullTransaction) -> bool {
        tx.outputs
            .iter()
            .any(|o| o.is_mine() && o.script_type.is_irregular())
    }
}

impl BloomFilterProvider for IrregularOutputsProvider {
    fn filter_elements(&self) -> Result<Vec<Vec<u8>>, BloomFilterError> {
        Ok(self
            .storage
            .unspent_outputs()?
            .into_iter()
            .filter(|u| u.output.script_type.is_irregular())
            .map(|u| u.output.outpoint().serialize())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::lock_script;
    use crate::core::{Output, ScriptType};
    use crate::storage::MemoryStorage;
    use crate::test_utils::{incoming_transaction, test_deriver};

    #[test]
    fn test_public_key_elements_fill_gap() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = PublicKeyManager::new(storage.clone(), test_deriver(), 3);

        let elements = manager.filter_elements().unwrap();
        // three elements for each of 3 keys on both chains
        assert_eq!(elements.len(), 18);
        let key = storage.public_key("0/0/2").unwrap().unwrap();
        assert!(elements.contains(&key.script_hash_for_p2wpkh));
    }

    #[test]
    fn test_pending_and_irregular_outpoints() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = PublicKeyManager::new(storage.clone(), test_deriver(), 1);
        manager.fill_gap().unwrap();
        let key = storage.public_key("0/0/0").unwrap().unwrap();

        let mut tx = incoming_transaction(&key, &[1_000, 2_000]);
        let script = lock_script(ScriptType::P2wpkh, &key.key_hash).unwrap();
        tx.outputs[1] = Output::with_type(2_000, 1, script, ScriptType::P2wpkh, Some(key.key_hash.clone()));
        tx.outputs[1].public_key_path = Some(key.path.clone());
        tx.set_hash();
        assert!(IrregularOutputsProvider::has_irregular_output(&tx));
        storage.add_transaction(tx.clone()).unwrap();

        let pending = PendingOutpointsProvider::new(storage.clone()).filter_elements().unwrap();
        assert_eq!(pending.len(), 2);

        let irregular = IrregularOutputsProvider::new(storage).filter_elements().unwrap();
        assert_eq!(irregular, vec![tx.outputs[1].outpoint().serialize()]);
    }
}
