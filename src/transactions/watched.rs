//! Application-defined transaction watches

use crate::bloom::{BloomFilterError, BloomFilterProvider};
use crate::core::{FullTransaction, OutPoint, ScriptType};
use crate::events::{EventDispatcher, KitEvent};
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// What a watch matches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchedFilter {
    /// A transaction spending this outpoint
    Outpoint { outpoint: OutPoint },
    /// A transaction paying to this P2SH script hash
    P2shScriptHash { script_hash: Vec<u8> },
}

impl WatchedFilter {
    fn element(&self) -> Vec<u8> {
        match self {
            Self::Outpoint { outpoint } => outpoint.serialize(),
            Self::P2shScriptHash { script_hash } => script_hash.clone(),
        }
    }

    pub fn matches(&self, tx: &FullTransaction) -> bool {
        match self {
            Self::Outpoint { outpoint } => tx.inputs.iter().any(|i| &i.previous_output == outpoint),
            Self::P2shScriptHash { script_hash } => tx.outputs.iter().any(|o| {
                o.script_type == ScriptType::P2sh && o.key_hash.as_deref() == Some(script_hash.as_slice())
            }),
        }
    }
}

pub struct WatchedTransactionManager {
    filters: Mutex<Vec<WatchedFilter>>,
    events: Arc<EventDispatcher>,
}

impl WatchedTransactionManager {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            filters: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Returns false when the filter was already watched
    pub fn add(&self, filter: WatchedFilter) -> bool {
        let mut filters = lock(&self.filters);
        if filters.contains(&filter) {
            return false;
        }
        filters.push(filter);
        true
    }

    pub fn remove(&self, filter: &WatchedFilter) {
        lock(&self.filters).retain(|f| f != filter);
    }

    /// Report `tx` for every watch it matches
    pub fn check(&self, tx: &FullTransaction) {
        let matched: Vec<WatchedFilter> = lock(&self.filters)
            .iter()
            .filter(|f| f.matches(tx))
            .cloned()
            .collect();
        for filter in matched {
            log::debug!("Watched transaction found: {}", tx.header.data_hash);
            self.events.emit(KitEvent::WatchedTransactionFound {
                filter,
                transaction_hash: tx.header.data_hash.to_hex(),
            });
        }
    }
}

impl BloomFilterProvider for WatchedTransactionManager {
    fn filter_elements(&self) -> Result<Vec<Vec<u8>>, BloomFilterError> {
        Ok(lock(&self.filters).iter().map(WatchedFilter::element).collect())
    }
}
