//! Wallet key bookkeeping
//!
//! Keeps `gap_limit` consecutive unused keys derived after the last used
//! key on each chain, so payments to any address a peer wallet may still
//! hand out are detected.

use crate::core::PublicKey;
use crate::storage::{PublicKeyWithUsedState, Storage, StorageError};
use crate::wallet::hd::{KeyDerivationError, KeyDeriver};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublicKeyManagerError {
    #[error("No unused public key available")]
    NoUnusedPublicKey,
    #[error("Invalid key path: {0}")]
    InvalidPath(String),
    #[error("Key derivation error: {0}")]
    Derivation(#[from] KeyDerivationError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub struct PublicKeyManager {
    storage: Arc<dyn Storage>,
    deriver: Arc<dyn KeyDeriver>,
    gap_limit: u32,
    account: u32,
}

/// Used-state summary of one chain
struct ChainState {
    last_used_index: Option<u32>,
    keys: Vec<PublicKeyWithUsedState>,
}

impl ChainState {
    /// Unused keys after the last used one
    fn gap_keys_count(&self) -> u32 {
        self.keys
            .iter()
            .filter(|k| !k.used && self.last_used_index.map_or(true, |last| k.public_key.index > last))
            .count() as u32
    }

    fn next_index(&self) -> u32 {
        self.keys
            .iter()
            .map(|k| k.public_key.index + 1)
            .max()
            .unwrap_or(0)
    }
}

impl PublicKeyManager {
    pub fn new(storage: Arc<dyn Storage>, deriver: Arc<dyn KeyDeriver>, gap_limit: u32) -> Self {
        Self {
            storage,
            deriver,
            gap_limit,
            account: 0,
        }
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    pub fn deriver(&self) -> &Arc<dyn KeyDeriver> {
        &self.deriver
    }

    fn chain_state(&self, all: &[PublicKeyWithUsedState], external: bool) -> ChainState {
        let mut keys: Vec<PublicKeyWithUsedState> = all
            .iter()
            .filter(|k| k.public_key.external == external && k.public_key.account == self.account)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.public_key.index);

        let last_used_index = keys.iter().filter(|k| k.used).map(|k| k.public_key.index).max();
        ChainState {
            last_used_index,
            keys,
        }
    }

    /// Derive and persist keys until both chains have `gap_limit` unused
    /// keys after their last used key. Returns how many keys were added.
    pub fn fill_gap(&self) -> Result<usize, PublicKeyManagerError> {
        let all = self.storage.public_keys_with_used_state()?;
        let mut new_keys = Vec::new();

        for external in [true, false] {
            let state = self.chain_state(&all, external);
            let gap = state.gap_keys_count();
            if gap < self.gap_limit {
                let start = state.next_index();
                let count = self.gap_limit - gap;
                new_keys.extend(self.deriver.public_keys(self.account, start..start + count, external)?);
            }
        }

        let added = new_keys.len();
        if added > 0 {
            self.storage.add_public_keys(new_keys)?;
            log::debug!("Derived {} new public keys", added);
        }
        Ok(added)
    }

    /// Keys the filter does not yet cover are needed: some chain has fewer
    /// than `gap_limit` unused keys after its last used key
    pub fn gap_shifts(&self) -> Result<bool, PublicKeyManagerError> {
        let all = self.storage.public_keys_with_used_state()?;
        Ok([true, false]
            .into_iter()
            .any(|external| self.chain_state(&all, external).gap_keys_count() < self.gap_limit))
    }

    /// First unused receive key
    pub fn receive_public_key(&self) -> Result<PublicKey, PublicKeyManagerError> {
        self.first_unused(true)
    }

    /// First unused change key
    pub fn change_public_key(&self) -> Result<PublicKey, PublicKeyManagerError> {
        self.first_unused(false)
    }

    fn first_unused(&self, external: bool) -> Result<PublicKey, PublicKeyManagerError> {
        let all = self.storage.public_keys_with_used_state()?;
        let state = self.chain_state(&all, external);
        state
            .keys
            .into_iter()
            .find(|k| !k.used && state.last_used_index.map_or(true, |last| k.public_key.index > last))
            .map(|k| k.public_key)
            .ok_or(PublicKeyManagerError::NoUnusedPublicKey)
    }

    pub fn public_key(&self, path: &str) -> Result<PublicKey, PublicKeyManagerError> {
        self.storage
            .public_key(path)?
            .ok_or_else(|| PublicKeyManagerError::InvalidPath(path.to_string()))
    }

    pub fn public_keys(&self) -> Result<Vec<PublicKey>, PublicKeyManagerError> {
        Ok(self.storage.public_keys()?)
    }

    /// Keys of one chain that have received funds
    pub fn used_public_keys(&self, external: bool) -> Result<Vec<PublicKey>, PublicKeyManagerError> {
        let all = self.storage.public_keys_with_used_state()?;
        Ok(self
            .chain_state(&all, external)
            .keys
            .into_iter()
            .filter(|k| k.used)
            .map(|k| k.public_key)
            .collect())
    }

    /// Derive keys without storing them, for restore scans
    pub fn derive_public_keys(
        &self,
        indices: std::ops::Range<u32>,
        external: bool,
    ) -> Result<Vec<PublicKey>, PublicKeyManagerError> {
        Ok(self.deriver.public_keys(self.account, indices, external)?)
    }

    /// Persist keys found during a restore scan
    pub fn add_keys(&self, keys: Vec<PublicKey>) -> Result<(), PublicKeyManagerError> {
        if !keys.is_empty() {
            self.storage.add_public_keys(keys)?;
        }
        Ok(())
    }
}
