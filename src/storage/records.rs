//! Records kept by storage besides blocks and transactions

use crate::core::{FullTransaction, Output, PublicKey, Transaction};
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};

/// Broadcast bookkeeping of an outgoing transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentTransaction {
    pub data_hash: Hash256,
    pub first_send_time: i64,
    pub last_send_time: i64,
    pub retries_count: u32,
    /// Handed to at least one peer
    pub send_success: bool,
}

impl SentTransaction {
    pub fn new(data_hash: Hash256, now: i64) -> Self {
        Self {
            data_hash,
            first_send_time: now,
            last_send_time: now,
            retries_count: 0,
            send_success: false,
        }
    }
}

/// A known peer endpoint with a connection preference score
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// `host:port`
    pub ip: String,
    pub score: i32,
    pub connection_time: Option<i64>,
}

impl PeerAddress {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            score: 0,
            connection_time: None,
        }
    }
}

/// A transaction that lost a double-spend or was abandoned, with the
/// history entry it had when it was invalidated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidTransaction {
    pub transaction: FullTransaction,
    /// Frozen `TransactionInfo` as JSON
    pub transaction_info_json: String,
}

/// A spendable wallet output with everything needed to sign for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub output: Output,
    pub public_key: PublicKey,
    pub transaction: Transaction,
    pub block_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyWithUsedState {
    pub public_key: PublicKey,
    /// Some stored output pays to this key
    pub used: bool,
}
