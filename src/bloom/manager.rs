//! Bloom filter lifecycle
//!
//! The filter is rebuilt wholesale from every provider's elements and
//! handed to the listener only when the element set changed.

use crate::bloom::filter::BloomFilter;
use crate::bloom::providers::BloomFilterProvider;
use crate::storage::StorageError;
use crate::utils::{lock, read_lock, write_lock};
use crate::wallet::PublicKeyManagerError;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BloomFilterError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Public key error: {0}")]
    PublicKeys(#[from] PublicKeyManagerError),
}

/// Receives every newly built filter; the peer group pushes it to peers
pub trait BloomFilterListener: Send + Sync {
    fn bloom_filter_updated(&self, filter: &BloomFilter);
}

#[derive(Default)]
pub struct BloomFilterManager {
    providers: RwLock<Vec<Arc<dyn BloomFilterProvider>>>,
    listener: RwLock<Option<Arc<dyn BloomFilterListener>>>,
    /// Sorted element set of the current filter
    elements: Mutex<Vec<Vec<u8>>>,
    filter: Mutex<Option<BloomFilter>>,
}

impl BloomFilterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&self, provider: Arc<dyn BloomFilterProvider>) {
        write_lock(&self.providers).push(provider);
    }

    pub fn set_listener(&self, listener: Arc<dyn BloomFilterListener>) {
        *write_lock(&self.listener) = Some(listener);
    }

    /// Current filter, if any elements exist
    pub fn bloom_filter(&self) -> Option<BloomFilter> {
        lock(&self.filter).clone()
    }

    /// Rebuild from all providers. Returns whether a new filter was built.
    pub fn regenerate_bloom_filter(&self) -> Result<bool, BloomFilterError> {
        let providers = read_lock(&self.providers).clone();
        let mut elements = Vec::new();
        for provider in &providers {
            elements.extend(provider.filter_elements()?);
        }
        elements.sort();
        elements.dedup();

        if elements.is_empty() {
            return Ok(false);
        }

        let filter = {
            let mut current = lock(&self.elements);
            if *current == elements {
                return Ok(false);
            }
            let filter = BloomFilter::with_elements(&elements);
            *current = elements;
            *lock(&self.filter) = Some(filter.clone());
            filter
        };

        log::info!(
            "Bloom filter regenerated: {} bytes, {} hash functions",
            filter.size(),
            filter.hash_funcs()
        );
        if let Some(listener) = read_lock(&self.listener).clone() {
            listener.bloom_filter_updated(&filter);
        }
        Ok(true)
    }
}
