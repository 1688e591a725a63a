//! API-assisted restore
//!
//! Instead of scanning the chain from an old checkpoint, a restored
//! wallet asks a block explorer which blocks touch its addresses. Keys
//! are walked in batches of the gap limit until a batch has no history.

use crate::core::{AddressConverterChain, AddressError, BlockHash, ScriptType};
use crate::crypto::Hash256;
use crate::storage::{Storage, StorageError};
use crate::sync::kit_state::KitStateManager;
use crate::wallet::{PublicKeyManager, PublicKeyManagerError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiSyncError {
    #[error("Block hash request failed: {0}")]
    Fetch(String),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Public key error: {0}")]
    PublicKeys(#[from] PublicKeyManagerError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A block some address has history in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBlockHash {
    pub hash: Hash256,
    pub height: u32,
}

#[async_trait]
pub trait BlockHashFetcher: Send + Sync {
    async fn block_hashes(&self, addresses: &[String]) -> Result<Vec<ApiBlockHash>, ApiSyncError>;
}

pub struct ApiSyncer {
    storage: Arc<dyn Storage>,
    public_key_manager: Arc<PublicKeyManager>,
    address_converter: Arc<AddressConverterChain>,
    fetcher: Arc<dyn BlockHashFetcher>,
    kit_state: Arc<KitStateManager>,
    /// Output types a restored wallet may have received on
    script_types: Vec<ScriptType>,
}

impl ApiSyncer {
    pub fn new(
        storage: Arc<dyn Storage>,
        public_key_manager: Arc<PublicKeyManager>,
        address_converter: Arc<AddressConverterChain>,
        fetcher: Arc<dyn BlockHashFetcher>,
        kit_state: Arc<KitStateManager>,
    ) -> Self {
        Self {
            storage,
            public_key_manager,
            address_converter,
            fetcher,
            kit_state,
            script_types: vec![ScriptType::P2pkh, ScriptType::P2wpkh, ScriptType::P2wpkhSh],
        }
    }

    /// Queue every block with history of our keys, stopping each chain
    /// at the first batch without any. Returns the number of queued blocks.
    pub async fn sync(&self) -> Result<usize, ApiSyncError> {
        self.kit_state.set_api_syncing(0);
        let gap_limit = self.public_key_manager.gap_limit();
        let mut found: BTreeMap<u32, Hash256> = BTreeMap::new();

        for external in [true, false] {
            let mut start = 0;
            loop {
                let keys = self
                    .public_key_manager
                    .derive_public_keys(start..start + gap_limit, external)?;
                let mut addresses = Vec::with_capacity(keys.len() * self.script_types.len());
                for key in &keys {
                    for script_type in &self.script_types {
                        addresses.push(self.address_converter.convert_public_key(key, *script_type)?.string_value);
                    }
                }

                let hashes = self.fetcher.block_hashes(&addresses).await?;
                self.public_key_manager.add_keys(keys)?;
                if hashes.is_empty() {
                    break;
                }
                for api_hash in hashes {
                    found.insert(api_hash.height, api_hash.hash);
                }
                self.kit_state.set_api_syncing(found.len());
                start += gap_limit;
            }
        }

        let downloaded = self.storage.last_block()?.map_or(0, |b| b.height);
        let mut sequence = self.storage.last_block_hash()?.map_or(0, |h| h.sequence + 1);
        let mut block_hashes = Vec::new();
        for (height, hash) in found.into_iter().filter(|(height, _)| *height > downloaded) {
            if self.storage.block(&hash)?.is_none() {
                block_hashes.push(BlockHash::new(hash, Some(height), sequence));
                sequence += 1;
            }
        }

        let count = block_hashes.len();
        log::info!("API restore found {} blocks with wallet history", count);
        self.storage.add_block_hashes(block_hashes)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AddressConverter, Network};
    use crate::events::EventDispatcher;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{block_at, test_deriver, wallet_key};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockFetcher {
        history: HashMap<String, ApiBlockHash>,
        requests: Mutex<usize>,
    }

    #[async_trait]
    impl BlockHashFetcher for MockFetcher {
        async fn block_hashes(&self, addresses: &[String]) -> Result<Vec<ApiBlockHash>, ApiSyncError> {
            *self.requests.lock().unwrap() += 1;
            Ok(addresses.iter().filter_map(|a| self.history.get(a).cloned()).collect())
        }
    }

    #[tokio::test]
    async fn test_restore_walks_batches_until_gap() {
        let storage = Arc::new(MemoryStorage::new());
        storage.add_block(block_at(10, Hash256::ZERO)).unwrap();
        let converter = Arc::new(AddressConverterChain::for_network(Network::Mainnet));

        let address_of = |index: u32, external: bool, script_type: ScriptType| {
            converter
                .convert_public_key(&wallet_key(index, external), script_type)
                .unwrap()
                .string_value
        };
        let mut history = HashMap::new();
        history.insert(
            address_of(0, true, ScriptType::P2pkh),
            ApiBlockHash { hash: Hash256::digest(b"a"), height: 20 },
        );
        history.insert(
            address_of(3, true, ScriptType::P2wpkh),
            ApiBlockHash { hash: Hash256::digest(b"b"), height: 30 },
        );
        history.insert(
            address_of(0, false, ScriptType::P2pkh),
            ApiBlockHash { hash: Hash256::digest(b"c"), height: 25 },
        );
        // below the downloaded chain
        history.insert(
            address_of(1, false, ScriptType::P2wpkhSh),
            ApiBlockHash { hash: Hash256::digest(b"d"), height: 5 },
        );
        let fetcher = Arc::new(MockFetcher {
            history,
            requests: Mutex::new(0),
        });

        let events = Arc::new(EventDispatcher::new());
        let syncer = ApiSyncer::new(
            storage.clone(),
            Arc::new(PublicKeyManager::new(storage.clone(), test_deriver(), 2)),
            converter.clone(),
            fetcher.clone(),
            Arc::new(KitStateManager::new(events)),
        );

        assert_eq!(syncer.sync().await.unwrap(), 3);
        // external: [0,1] [2,3] [4,5]; internal: [0,1] [2,3]
        assert_eq!(*fetcher.requests.lock().unwrap(), 5);

        let queued = storage.block_hashes(10).unwrap();
        let heights: Vec<_> = queued.iter().map(|h| h.height).collect();
        assert_eq!(heights, vec![Some(20), Some(25), Some(30)]);
        assert!(storage.public_key("0/0/5").unwrap().is_some());
        assert!(storage.public_key("0/1/3").unwrap().is_some());
        assert!(converter.convert_string(&address_of(0, true, ScriptType::P2pkh)).is_ok());
    }
}
