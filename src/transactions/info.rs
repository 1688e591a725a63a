//! Transaction history entries for the application

use crate::core::{FullTransaction, TransactionStatus, TransactionType};
use crate::storage::{Storage, StorageResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInputInfo {
    pub mine: bool,
    /// Known when the spent output is stored
    pub value: Option<u64>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutputInfo {
    pub mine: bool,
    pub change_output: bool,
    pub value: u64,
    pub address: Option<String>,
    pub plugin_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub uid: String,
    pub transaction_hash: String,
    pub transaction_index: u32,
    pub inputs: Vec<TransactionInputInfo>,
    pub outputs: Vec<TransactionOutputInfo>,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub fee: Option<u64>,
    pub block_height: Option<u32>,
    pub timestamp: i64,
    pub status: TransactionStatus,
    pub conflicting_hash: Option<String>,
}

impl TransactionInfo {
    /// Newest first: timestamp, then order, then uid
    fn newest_first(a: &Self, b: &Self) -> Ordering {
        (b.timestamp, b.transaction_index, &b.uid).cmp(&(a.timestamp, a.transaction_index, &a.uid))
    }
}

/// History filter; sent-to-self transactions match both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionFilterType {
    Incoming,
    Outgoing,
    SentToSelf,
}

impl TransactionFilterType {
    pub fn matches(&self, transaction_type: TransactionType) -> bool {
        match self {
            Self::Incoming => matches!(
                transaction_type,
                TransactionType::Incoming | TransactionType::SentToSelf
            ),
            Self::Outgoing => matches!(
                transaction_type,
                TransactionType::Outgoing | TransactionType::SentToSelf
            ),
            Self::SentToSelf => transaction_type == TransactionType::SentToSelf,
        }
    }
}

pub struct TransactionInfoConverter {
    storage: Arc<dyn Storage>,
}

impl TransactionInfoConverter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn transaction_info(&self, tx: &FullTransaction) -> StorageResult<TransactionInfo> {
        let mut inputs = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let previous = self.storage.output(&input.previous_output)?;
            inputs.push(TransactionInputInfo {
                mine: previous.as_ref().map_or(false, |o| o.is_mine()),
                value: previous.map(|o| o.value),
                address: input.address.clone(),
            });
        }

        let outputs = tx
            .outputs
            .iter()
            .map(|o| TransactionOutputInfo {
                mine: o.is_mine(),
                change_output: o.change_output,
                value: o.value,
                address: o.address.clone(),
                plugin_data: o.plugin_data.clone(),
            })
            .collect();

        let block_height = match &tx.header.block_hash {
            Some(hash) => self.storage.block(hash)?.map(|b| b.height),
            None => None,
        };

        Ok(TransactionInfo {
            uid: tx.header.uid.clone(),
            transaction_hash: tx.header.data_hash.to_hex(),
            transaction_index: tx.header.order,
            inputs,
            outputs,
            amount: tx.metadata.amount,
            transaction_type: tx.metadata.transaction_type,
            fee: tx.metadata.fee,
            block_height,
            timestamp: tx.header.timestamp,
            status: tx.header.status,
            conflicting_hash: tx.header.conflicting_tx_hash.map(|h| h.to_hex()),
        })
    }

    /// History page: entries older than `from_uid` (or the newest when
    /// `None`), optionally filtered, at most `limit` long
    pub fn transactions(
        &self,
        from_uid: Option<&str>,
        filter: Option<TransactionFilterType>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<TransactionInfo>> {
        let mut infos = Vec::new();
        for tx in self.storage.full_transactions()? {
            if tx.header.is_mine {
                infos.push(self.transaction_info(&tx)?);
            }
        }
        for invalid in self.storage.invalid_transactions()? {
            match serde_json::from_str::<TransactionInfo>(&invalid.transaction_info_json) {
                Ok(info) => infos.push(info),
                Err(e) => log::warn!(
                    "Dropping unreadable snapshot of {}: {}",
                    invalid.transaction.header.data_hash,
                    e
                ),
            }
        }
        infos.sort_by(TransactionInfo::newest_first);

        let start = match from_uid {
            Some(uid) => match infos.iter().position(|i| i.uid == uid) {
                Some(position) => position + 1,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };

        Ok(infos
            .into_iter()
            .skip(start)
            .filter(|i| filter.map_or(true, |f| f.matches(i.transaction_type)))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InvalidTransaction;
    use crate::test_utils::{block_at, incoming_transaction, spending_transaction, storage_with_keys};
    use crate::crypto::Hash256;

    #[test]
    fn test_info_of_confirmed_transaction() {
        let storage = storage_with_keys(1);
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let block = block_at(7, Hash256::ZERO);
        storage.add_block(block.clone()).unwrap();

        let mut tx = incoming_transaction(&key, &[5_000]);
        tx.header.block_hash = Some(block.header_hash);
        tx.metadata.amount = 5_000;
        let info = TransactionInfoConverter::new(storage).transaction_info(&tx).unwrap();

        assert_eq!(info.block_height, Some(7));
        assert_eq!(info.transaction_hash, tx.hash().to_hex());
        assert_eq!(info.amount, 5_000);
        assert!(info.outputs[0].mine);
        assert!(!info.inputs[0].mine);
        assert_eq!(info.inputs[0].value, None);
    }

    #[test]
    fn test_pagination_and_filter() {
        let storage = storage_with_keys(1);
        let key = storage.public_key("0/0/0").unwrap().unwrap();

        let mut uids = Vec::new();
        for i in 0..4 {
            let mut tx = incoming_transaction(&key, &[1_000 + i]);
            tx.header.timestamp = 1_000 + i as i64;
            if i == 2 {
                tx.metadata.transaction_type = TransactionType::Outgoing;
            }
            uids.push(tx.header.uid.clone());
            storage.add_transaction(tx).unwrap();
        }
        let converter = TransactionInfoConverter::new(storage);

        let page = converter.transactions(None, None, Some(2)).unwrap();
        let page_uids: Vec<_> = page.iter().map(|i| i.uid.clone()).collect();
        assert_eq!(page_uids, vec![uids[3].clone(), uids[2].clone()]);

        let next = converter.transactions(Some(&uids[2]), None, None).unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].uid, uids[1]);

        let incoming = converter
            .transactions(None, Some(TransactionFilterType::Incoming), None)
            .unwrap();
        assert_eq!(incoming.len(), 3);
        let outgoing = converter
            .transactions(None, Some(TransactionFilterType::Outgoing), None)
            .unwrap();
        assert_eq!(outgoing[0].uid, uids[2]);

        assert!(converter.transactions(Some("unknown"), None, None).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_transactions_listed_from_snapshot() {
        let storage = storage_with_keys(1);
        let tx = spending_transaction(&[], 100);
        let converter = TransactionInfoConverter::new(storage.clone());

        let mut info = converter.transaction_info(&tx).unwrap();
        info.status = TransactionStatus::Invalid;
        info.amount = -4_200;
        storage
            .move_to_invalid(vec![InvalidTransaction {
                transaction: tx,
                transaction_info_json: serde_json::to_string(&info).unwrap(),
            }])
            .unwrap();

        let listed = converter.transactions(None, None, None).unwrap();
        assert_eq!(listed, vec![info]);
    }

    #[test]
    fn test_filter_matches_sent_to_self_both_ways() {
        assert!(TransactionFilterType::Incoming.matches(TransactionType::SentToSelf));
        assert!(TransactionFilterType::Outgoing.matches(TransactionType::SentToSelf));
        assert!(!TransactionFilterType::SentToSelf.matches(TransactionType::Incoming));
    }
}
