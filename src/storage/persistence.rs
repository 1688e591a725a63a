//! Snapshot persistence for `MemoryStorage`
//!
//! The whole store is written as one JSON document. Writes go to a
//! temporary file which is then renamed over the target, so a crash never
//! leaves a half-written snapshot behind.

use super::memory::StorageData;
use super::{InvalidTransaction, MemoryStorage, PeerAddress, SentTransaction, StorageError};
use crate::core::{Block, BlockHash, FullTransaction, PublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Serializable form of every storage table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub blocks: Vec<Block>,
    pub block_hashes: Vec<BlockHash>,
    pub transactions: Vec<FullTransaction>,
    pub invalid_transactions: Vec<InvalidTransaction>,
    pub public_keys: Vec<PublicKey>,
    pub sent_transactions: Vec<SentTransaction>,
    pub peer_addresses: Vec<PeerAddress>,
}

impl From<&StorageData> for StorageSnapshot {
    fn from(data: &StorageData) -> Self {
        let mut blocks: Vec<Block> = data.blocks.values().cloned().collect();
        blocks.sort_by_key(|b| b.height);
        let mut block_hashes: Vec<BlockHash> = data.block_hashes.values().cloned().collect();
        block_hashes.sort_by_key(|h| h.sequence);

        Self {
            blocks,
            block_hashes,
            transactions: data.transactions.values().cloned().collect(),
            invalid_transactions: data.invalid_transactions.values().cloned().collect(),
            public_keys: data.public_keys.values().cloned().collect(),
            sent_transactions: data.sent_transactions.values().cloned().collect(),
            peer_addresses: data.peer_addresses.values().cloned().collect(),
        }
    }
}

impl From<StorageSnapshot> for StorageData {
    fn from(snapshot: StorageSnapshot) -> Self {
        let mut data = StorageData::default();
        data.blocks = snapshot.blocks.into_iter().map(|b| (b.header_hash, b)).collect();
        data.block_hashes = snapshot
            .block_hashes
            .into_iter()
            .map(|h| (h.header_hash, h))
            .collect();
        data.transactions = snapshot
            .transactions
            .into_iter()
            .map(|tx| (tx.hash(), tx))
            .collect();
        data.invalid_transactions = snapshot
            .invalid_transactions
            .into_iter()
            .map(|tx| (tx.transaction.hash(), tx))
            .collect();
        for key in snapshot.public_keys {
            data.insert_public_key(key);
        }
        data.sent_transactions = snapshot
            .sent_transactions
            .into_iter()
            .map(|s| (s.data_hash, s))
            .collect();
        data.peer_addresses = snapshot
            .peer_addresses
            .into_iter()
            .map(|a| (a.ip.clone(), a))
            .collect();
        data
    }
}

/// Write the storage contents to `path`
pub fn save_snapshot(storage: &MemoryStorage, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("tmp");
    {
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &storage.snapshot())?;
        writer.flush()?;
    }

    // Atomic rename
    fs::rename(&temp_path, path)?;
    log::debug!("Storage snapshot written to {}", path.display());
    Ok(())
}

/// Load a storage previously written with `save_snapshot`
pub fn load_snapshot(path: &Path) -> Result<MemoryStorage, StorageError> {
    if !path.exists() {
        return Err(StorageError::NotFound(format!(
            "snapshot {}",
            path.display()
        )));
    }

    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let snapshot: StorageSnapshot = serde_json::from_reader(reader)?;
    Ok(MemoryStorage::from_snapshot(snapshot))
}
