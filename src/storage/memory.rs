//! In-memory `Storage`
//!
//! All tables sit behind one `RwLock`, so every call observes and leaves
//! a consistent state.

use super::persistence::StorageSnapshot;
use super::{
    InvalidTransaction, PeerAddress, PublicKeyWithUsedState, SentTransaction, Storage,
    StorageError, StorageResult, UnspentOutput,
};
use crate::core::{Block, BlockHash, FullTransaction, Input, OutPoint, Output, PublicKey, Transaction, TransactionStatus};
use crate::crypto::Hash256;
use crate::utils::{read_lock, write_lock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Default, Clone)]
pub(crate) struct StorageData {
    pub blocks: HashMap<Hash256, Block>,
    pub block_hashes: HashMap<Hash256, BlockHash>,
    pub transactions: HashMap<Hash256, FullTransaction>,
    pub invalid_transactions: HashMap<Hash256, InvalidTransaction>,
    /// Keyed by (account, change chain, index)
    pub public_keys: BTreeMap<(u32, bool, u32), PublicKey>,
    pub sent_transactions: HashMap<Hash256, SentTransaction>,
    pub peer_addresses: HashMap<String, PeerAddress>,
}

impl StorageData {
    fn key_of(public_key: &PublicKey) -> (u32, bool, u32) {
        (public_key.account, !public_key.external, public_key.index)
    }

    pub(crate) fn insert_public_key(&mut self, public_key: PublicKey) {
        self.public_keys.insert(Self::key_of(&public_key), public_key);
    }

    fn spent_outpoints(&self) -> HashSet<OutPoint> {
        self.transactions
            .values()
            .flat_map(|tx| tx.inputs.iter().map(|i| i.previous_output))
            .collect()
    }

    fn used_key_paths(&self) -> HashSet<&str> {
        self.transactions
            .values()
            .flat_map(|tx| tx.outputs.iter())
            .filter_map(|o| o.public_key_path.as_deref())
            .collect()
    }
}

/// Thread-safe in-memory storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<StorageData>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state, for persisting
    pub fn snapshot(&self) -> StorageSnapshot {
        StorageSnapshot::from(&*read_lock(&self.data))
    }

    pub fn from_snapshot(snapshot: StorageSnapshot) -> Self {
        Self {
            data: RwLock::new(snapshot.into()),
        }
    }
}

impl Storage for MemoryStorage {
    // =========================================================================
    // Blocks
    // =========================================================================

    fn last_block(&self) -> StorageResult<Option<Block>> {
        let data = read_lock(&self.data);
        Ok(data
            .blocks
            .values()
            .max_by_key(|b| (b.height, !b.stale))
            .cloned())
    }

    fn block(&self, hash: &Hash256) -> StorageResult<Option<Block>> {
        Ok(read_lock(&self.data).blocks.get(hash).cloned())
    }

    fn block_by_height(&self, height: u32) -> StorageResult<Option<Block>> {
        let data = read_lock(&self.data);
        Ok(data
            .blocks
            .values()
            .filter(|b| b.height == height)
            .min_by_key(|b| b.stale)
            .cloned())
    }

    fn blocks_count(&self) -> StorageResult<usize> {
        Ok(read_lock(&self.data).blocks.len())
    }

    fn blocks(&self, stale: bool) -> StorageResult<Vec<Block>> {
        let data = read_lock(&self.data);
        let mut blocks: Vec<Block> = data
            .blocks
            .values()
            .filter(|b| b.stale == stale)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.height);
        Ok(blocks)
    }

    fn latest_blocks(&self, count: usize) -> StorageResult<Vec<Block>> {
        let mut blocks = self.blocks(false)?;
        blocks.reverse();
        blocks.truncate(count);
        Ok(blocks)
    }

    fn add_block(&self, block: Block) -> StorageResult<()> {
        write_lock(&self.data).blocks.insert(block.header_hash, block);
        Ok(())
    }

    fn update_block(&self, block: &Block) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        match data.blocks.get_mut(&block.header_hash) {
            Some(stored) => {
                *stored = block.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("block {}", block.header_hash))),
        }
    }

    fn delete_blocks(&self, hashes: &[Hash256]) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        for hash in hashes {
            data.blocks.remove(hash);
        }
        Ok(())
    }

    fn unstale_all_blocks(&self) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        for block in data.blocks.values_mut() {
            block.stale = false;
        }
        Ok(())
    }

    // =========================================================================
    // Block hashes
    // =========================================================================

    fn add_block_hashes(&self, hashes: Vec<BlockHash>) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        for hash in hashes {
            data.block_hashes.insert(hash.header_hash, hash);
        }
        Ok(())
    }

    fn block_hashes(&self, limit: usize) -> StorageResult<Vec<BlockHash>> {
        let data = read_lock(&self.data);
        let mut hashes: Vec<BlockHash> = data.block_hashes.values().cloned().collect();
        hashes.sort_by_key(|h| h.sequence);
        hashes.truncate(limit);
        Ok(hashes)
    }

    fn last_block_hash(&self) -> StorageResult<Option<BlockHash>> {
        let data = read_lock(&self.data);
        Ok(data.block_hashes.values().max_by_key(|h| h.sequence).cloned())
    }

    fn block_hashes_count(&self) -> StorageResult<usize> {
        Ok(read_lock(&self.data).block_hashes.len())
    }

    fn delete_block_hash(&self, hash: &Hash256) -> StorageResult<()> {
        write_lock(&self.data).block_hashes.remove(hash);
        Ok(())
    }

    fn delete_blockchain_block_hashes(&self) -> StorageResult<()> {
        write_lock(&self.data)
            .block_hashes
            .retain(|_, h| h.height.is_some());
        Ok(())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    fn transaction(&self, hash: &Hash256) -> StorageResult<Option<Transaction>> {
        Ok(read_lock(&self.data)
            .transactions
            .get(hash)
            .map(|tx| tx.header.clone()))
    }

    fn full_transaction(&self, hash: &Hash256) -> StorageResult<Option<FullTransaction>> {
        Ok(read_lock(&self.data).transactions.get(hash).cloned())
    }

    fn full_transaction_by_uid(&self, uid: &str) -> StorageResult<Option<FullTransaction>> {
        Ok(read_lock(&self.data)
            .transactions
            .values()
            .find(|tx| tx.header.uid == uid)
            .cloned())
    }

    fn full_transactions(&self) -> StorageResult<Vec<FullTransaction>> {
        Ok(read_lock(&self.data).transactions.values().cloned().collect())
    }

    fn transactions_of_block(&self, block_hash: &Hash256) -> StorageResult<Vec<FullTransaction>> {
        let data = read_lock(&self.data);
        let mut transactions: Vec<FullTransaction> = data
            .transactions
            .values()
            .filter(|tx| tx.header.block_hash.as_ref() == Some(block_hash))
            .cloned()
            .collect();
        transactions.sort_by_key(|tx| tx.header.order);
        Ok(transactions)
    }

    fn pending_transactions(&self) -> StorageResult<Vec<FullTransaction>> {
        let data = read_lock(&self.data);
        Ok(data
            .transactions
            .values()
            .filter(|tx| tx.header.is_pending())
            .cloned()
            .collect())
    }

    fn new_transactions(&self) -> StorageResult<Vec<FullTransaction>> {
        let data = read_lock(&self.data);
        Ok(data
            .transactions
            .values()
            .filter(|tx| tx.header.status == TransactionStatus::New)
            .cloned()
            .collect())
    }

    fn add_transaction(&self, transaction: FullTransaction) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        let hash = transaction.hash();
        data.invalid_transactions.remove(&hash);
        data.transactions.insert(hash, transaction);
        Ok(())
    }

    fn update_transaction(&self, header: &Transaction) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        match data.transactions.get_mut(&header.data_hash) {
            Some(stored) => {
                stored.header = header.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("transaction {}", header.data_hash))),
        }
    }

    fn update_output(&self, output: &Output) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        let stored = data
            .transactions
            .get_mut(&output.transaction_hash)
            .and_then(|tx| tx.outputs.iter_mut().find(|o| o.index == output.index));
        match stored {
            Some(stored) => {
                *stored = output.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "output {}:{}",
                output.transaction_hash, output.index
            ))),
        }
    }

    fn delete_transaction(&self, hash: &Hash256) -> StorageResult<()> {
        write_lock(&self.data).transactions.remove(hash);
        Ok(())
    }

    fn output(&self, outpoint: &OutPoint) -> StorageResult<Option<Output>> {
        let data = read_lock(&self.data);
        Ok(data
            .transactions
            .get(&outpoint.hash)
            .and_then(|tx| tx.outputs.iter().find(|o| o.index == outpoint.index))
            .cloned())
    }

    fn inputs_spending(&self, outpoint: &OutPoint) -> StorageResult<Vec<Input>> {
        let data = read_lock(&self.data);
        Ok(data
            .transactions
            .values()
            .flat_map(|tx| tx.inputs.iter())
            .filter(|i| &i.previous_output == outpoint)
            .cloned()
            .collect())
    }

    fn unspent_outputs(&self) -> StorageResult<Vec<UnspentOutput>> {
        let data = read_lock(&self.data);
        let spent = data.spent_outpoints();
        let keys_by_path: HashMap<&str, &PublicKey> = data
            .public_keys
            .values()
            .map(|k| (k.path.as_str(), k))
            .collect();

        let mut unspent = Vec::new();
        for tx in data.transactions.values() {
            let block_height = tx
                .header
                .block_hash
                .and_then(|hash| data.blocks.get(&hash))
                .map(|b| b.height);

            for output in &tx.outputs {
                let Some(path) = output.public_key_path.as_deref() else {
                    continue;
                };
                if spent.contains(&output.outpoint()) {
                    continue;
                }
                let Some(public_key) = keys_by_path.get(path) else {
                    continue;
                };
                unspent.push(UnspentOutput {
                    output: output.clone(),
                    public_key: (*public_key).clone(),
                    transaction: tx.header.clone(),
                    block_height,
                });
            }
        }
        Ok(unspent)
    }

    // =========================================================================
    // Invalid transactions
    // =========================================================================

    fn invalid_transaction(&self, hash: &Hash256) -> StorageResult<Option<InvalidTransaction>> {
        Ok(read_lock(&self.data).invalid_transactions.get(hash).cloned())
    }

    fn invalid_transactions(&self) -> StorageResult<Vec<InvalidTransaction>> {
        Ok(read_lock(&self.data)
            .invalid_transactions
            .values()
            .cloned()
            .collect())
    }

    fn move_to_invalid(&self, transactions: Vec<InvalidTransaction>) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        for invalid in transactions {
            let hash = invalid.transaction.hash();
            data.transactions.remove(&hash);
            data.invalid_transactions.insert(hash, invalid);
        }
        Ok(())
    }

    fn delete_invalid_transaction(&self, hash: &Hash256) -> StorageResult<()> {
        write_lock(&self.data).invalid_transactions.remove(hash);
        Ok(())
    }

    // =========================================================================
    // Public keys
    // =========================================================================

    fn public_keys(&self) -> StorageResult<Vec<PublicKey>> {
        Ok(read_lock(&self.data).public_keys.values().cloned().collect())
    }

    fn public_key(&self, path: &str) -> StorageResult<Option<PublicKey>> {
        Ok(read_lock(&self.data)
            .public_keys
            .values()
            .find(|k| k.path == path)
            .cloned())
    }

    fn public_key_by_hash(&self, hash: &[u8]) -> StorageResult<Option<PublicKey>> {
        Ok(read_lock(&self.data)
            .public_keys
            .values()
            .find(|k| k.matches(hash))
            .cloned())
    }

    fn add_public_keys(&self, keys: Vec<PublicKey>) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        for key in keys {
            data.insert_public_key(key);
        }
        Ok(())
    }

    fn public_keys_with_used_state(&self) -> StorageResult<Vec<PublicKeyWithUsedState>> {
        let data = read_lock(&self.data);
        let used = data.used_key_paths();
        Ok(data
            .public_keys
            .values()
            .map(|k| PublicKeyWithUsedState {
                used: used.contains(k.path.as_str()),
                public_key: k.clone(),
            })
            .collect())
    }

    // =========================================================================
    // Sent transactions
    // =========================================================================

    fn sent_transaction(&self, hash: &Hash256) -> StorageResult<Option<SentTransaction>> {
        Ok(read_lock(&self.data).sent_transactions.get(hash).cloned())
    }

    fn save_sent_transaction(&self, sent: SentTransaction) -> StorageResult<()> {
        write_lock(&self.data)
            .sent_transactions
            .insert(sent.data_hash, sent);
        Ok(())
    }

    fn delete_sent_transaction(&self, hash: &Hash256) -> StorageResult<()> {
        write_lock(&self.data).sent_transactions.remove(hash);
        Ok(())
    }

    // =========================================================================
    // Peer addresses
    // =========================================================================

    fn peer_addresses(&self, exclude: &[String], limit: usize) -> StorageResult<Vec<PeerAddress>> {
        let data = read_lock(&self.data);
        let mut addresses: Vec<PeerAddress> = data
            .peer_addresses
            .values()
            .filter(|a| !exclude.contains(&a.ip))
            .cloned()
            .collect();
        addresses.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.ip.cmp(&b.ip)));
        addresses.truncate(limit);
        Ok(addresses)
    }

    fn add_peer_addresses(&self, addresses: Vec<PeerAddress>) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        for address in addresses {
            data.peer_addresses.entry(address.ip.clone()).or_insert(address);
        }
        Ok(())
    }

    fn increase_peer_address_score(&self, ip: &str) -> StorageResult<()> {
        if let Some(address) = write_lock(&self.data).peer_addresses.get_mut(ip) {
            address.score += 1;
        }
        Ok(())
    }

    fn set_peer_connection_time(&self, ip: &str, time: i64) -> StorageResult<()> {
        if let Some(address) = write_lock(&self.data).peer_addresses.get_mut(ip) {
            address.connection_time = Some(time);
        }
        Ok(())
    }

    fn delete_peer_address(&self, ip: &str) -> StorageResult<()> {
        write_lock(&self.data).peer_addresses.remove(ip);
        Ok(())
    }

    // =========================================================================
    // Wallet
    // =========================================================================

    fn clear(&self, keep_up_to_height: u32) -> StorageResult<()> {
        let mut data = write_lock(&self.data);
        data.transactions.clear();
        data.invalid_transactions.clear();
        data.sent_transactions.clear();
        data.block_hashes.clear();
        data.blocks.retain(|_, b| b.height <= keep_up_to_height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{block_at, incoming_transaction, wallet_key};

    #[test]
    fn test_block_queries() {
        let storage = MemoryStorage::new();
        let genesis = block_at(0, Hash256::ZERO);
        let first = block_at(1, genesis.header_hash);
        let mut stale = block_at(1, genesis.header_hash);
        stale.header.nonce += 1;
        stale.header_hash = stale.header.hash();
        stale.stale = true;

        for block in [genesis.clone(), first.clone(), stale.clone()] {
            storage.add_block(block).unwrap();
        }

        assert_eq!(storage.blocks_count().unwrap(), 3);
        assert_eq!(storage.block_by_height(1).unwrap(), Some(first.clone()));
        assert_eq!(storage.blocks(true).unwrap(), vec![stale.clone()]);
        assert_eq!(storage.latest_blocks(1).unwrap(), vec![first]);

        storage.unstale_all_blocks().unwrap();
        assert!(storage.blocks(true).unwrap().is_empty());
    }

    #[test]
    fn test_unspent_outputs_exclude_spent() {
        let storage = MemoryStorage::new();
        let key = wallet_key(0, true);
        storage.add_public_keys(vec![key.clone()]).unwrap();

        let funding = incoming_transaction(&key, &[5_000, 7_000]);
        storage.add_transaction(funding.clone()).unwrap();
        assert_eq!(storage.unspent_outputs().unwrap().len(), 2);

        let spend = crate::test_utils::spending_transaction(&[funding.outputs[0].outpoint()], 4_000);
        storage.add_transaction(spend).unwrap();

        let unspent = storage.unspent_outputs().unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].output.value, 7_000);
        assert_eq!(unspent[0].public_key, key);

        let used = storage.public_keys_with_used_state().unwrap();
        assert!(used[0].used);
    }

    #[test]
    fn test_move_to_invalid() {
        let storage = MemoryStorage::new();
        let key = wallet_key(0, true);
        let tx = incoming_transaction(&key, &[1_000]);
        let hash = tx.hash();
        storage.add_transaction(tx.clone()).unwrap();

        storage
            .move_to_invalid(vec![InvalidTransaction {
                transaction: tx,
                transaction_info_json: "{}".to_string(),
            }])
            .unwrap();

        assert!(storage.transaction(&hash).unwrap().is_none());
        assert!(storage.invalid_transaction(&hash).unwrap().is_some());
    }

    #[test]
    fn test_peer_addresses_by_score() {
        let storage = MemoryStorage::new();
        storage
            .add_peer_addresses(vec![
                PeerAddress::new("10.0.0.1:8333"),
                PeerAddress::new("10.0.0.2:8333"),
                PeerAddress::new("10.0.0.3:8333"),
            ])
            .unwrap();
        storage.increase_peer_address_score("10.0.0.3:8333").unwrap();

        let best = storage.peer_addresses(&[], 2).unwrap();
        assert_eq!(best[0].ip, "10.0.0.3:8333");

        let excluded = storage
            .peer_addresses(&["10.0.0.3:8333".to_string()], 10)
            .unwrap();
        assert_eq!(excluded.len(), 2);

        storage.delete_peer_address("10.0.0.1:8333").unwrap();
        assert_eq!(storage.peer_addresses(&[], 10).unwrap().len(), 2);
    }

    #[test]
    fn test_clear_keeps_keys_and_low_blocks() {
        let storage = MemoryStorage::new();
        let key = wallet_key(0, true);
        storage.add_public_keys(vec![key.clone()]).unwrap();
        storage.add_transaction(incoming_transaction(&key, &[1_000])).unwrap();
        storage.add_block(block_at(0, Hash256::ZERO)).unwrap();
        storage.add_block(block_at(5, Hash256::ZERO)).unwrap();

        storage.clear(0).unwrap();
        assert!(storage.full_transactions().unwrap().is_empty());
        assert_eq!(storage.blocks_count().unwrap(), 1);
        assert_eq!(storage.public_keys().unwrap(), vec![key]);
    }
}
