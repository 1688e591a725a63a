//! Work a peer performs for the kit
//!
//! A task sends its requests when started, then sees every message the
//! peer delivers until it reports completion. Messages a task does not
//! consume are handled by the peer group as usual.

use crate::core::{BlockHash, FullTransaction};
use crate::crypto::Hash256;
use crate::network::message::{InventoryItem, InventoryType, Message};
use crate::network::peer::PeerError;
use crate::sync::{MerkleBlock, MerkleBlockValidator};
use std::collections::HashSet;
use std::time::Duration;

/// Results handed back to the peer group
#[derive(Debug)]
pub enum CompletedTask {
    /// Announced hashes in `getblocks` order; empty when the peer has
    /// nothing past our locator
    BlockHashes(Vec<Hash256>),
    /// Complete merkle blocks in request order
    MerkleBlocks(Vec<MerkleBlock>),
    TransactionSent(Hash256),
    TransactionsReceived(Vec<FullTransaction>),
}

/// What a task made of one message
#[derive(Debug)]
pub enum TaskResponse {
    NotHandled,
    Handled { send: Vec<Message> },
    Completed { send: Vec<Message>, result: CompletedTask },
}

/// What a task made of running out of time
#[derive(Debug)]
pub enum TaskTimeout {
    Failed(PeerError),
    Completed(CompletedTask),
}

#[derive(Debug)]
pub enum PeerTask {
    GetBlockHashes(GetBlockHashesTask),
    GetMerkleBlocks(GetMerkleBlocksTask),
    SendTransaction(SendTransactionTask),
    RequestTransactions(RequestTransactionsTask),
}

impl PeerTask {
    pub fn get_block_hashes(locator: Vec<Hash256>, protocol_version: i32) -> Self {
        PeerTask::GetBlockHashes(GetBlockHashesTask {
            locator,
            protocol_version,
            nonce: rand::random(),
        })
    }

    pub fn get_merkle_blocks(block_hashes: Vec<BlockHash>, validator: MerkleBlockValidator) -> Self {
        PeerTask::GetMerkleBlocks(GetMerkleBlocksTask {
            block_hashes,
            validator,
            received: Vec::new(),
            nonce: rand::random(),
        })
    }

    pub fn send_transaction(transaction: FullTransaction) -> Self {
        PeerTask::SendTransaction(SendTransactionTask {
            hash: transaction.hash(),
            transaction,
        })
    }

    pub fn request_transactions(hashes: Vec<Hash256>) -> Self {
        PeerTask::RequestTransactions(RequestTransactionsTask {
            hashes: hashes.into_iter().collect(),
            received: Vec::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerTask::GetBlockHashes(_) => "get_block_hashes",
            PeerTask::GetMerkleBlocks(_) => "get_merkle_blocks",
            PeerTask::SendTransaction(_) => "send_transaction",
            PeerTask::RequestTransactions(_) => "request_transactions",
        }
    }

    pub fn start(&self) -> Vec<Message> {
        match self {
            PeerTask::GetBlockHashes(task) => task.start(),
            PeerTask::GetMerkleBlocks(task) => task.start(),
            PeerTask::SendTransaction(task) => vec![Message::Inv(vec![InventoryItem::new(
                InventoryType::Tx,
                task.hash,
            )])],
            PeerTask::RequestTransactions(task) => vec![Message::GetData(
                task.hashes
                    .iter()
                    .map(|h| InventoryItem::new(InventoryType::Tx, *h))
                    .collect(),
            )],
        }
    }

    pub fn handle_message(&mut self, message: &Message) -> Result<TaskResponse, PeerError> {
        match self {
            PeerTask::GetBlockHashes(task) => Ok(task.handle_message(message)),
            PeerTask::GetMerkleBlocks(task) => task.handle_message(message),
            PeerTask::SendTransaction(task) => Ok(task.handle_message(message)),
            PeerTask::RequestTransactions(task) => Ok(task.handle_message(message)),
        }
    }

    pub fn handle_timeout(self) -> TaskTimeout {
        match self {
            PeerTask::RequestTransactions(task) => {
                TaskTimeout::Completed(CompletedTask::TransactionsReceived(task.received))
            }
            PeerTask::SendTransaction(task) => {
                TaskTimeout::Failed(PeerError::Timeout(format!("send of {}", task.hash)))
            }
            other => TaskTimeout::Failed(PeerError::Timeout(other.name().to_string())),
        }
    }

    /// A failure of this task says nothing bad about the peer
    pub fn is_disposable(&self) -> bool {
        matches!(self, PeerTask::SendTransaction(_) | PeerTask::RequestTransactions(_))
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        match self {
            // peers answer getdata for many filtered blocks slowly
            PeerTask::GetMerkleBlocks(task) => default + Duration::from_millis(100 * task.block_hashes.len() as u64),
            _ => default,
        }
    }
}

// =============================================================================
// Block hashes
// =============================================================================

#[derive(Debug)]
pub struct GetBlockHashesTask {
    locator: Vec<Hash256>,
    protocol_version: i32,
    nonce: u64,
}

impl GetBlockHashesTask {
    /// A peer stays silent on a `getblocks` it has nothing for, so a ping
    /// follows it; a pong before any inventory means no new blocks
    fn start(&self) -> Vec<Message> {
        vec![
            Message::GetBlocks {
                version: self.protocol_version,
                locator: self.locator.clone(),
                stop: Hash256::ZERO,
            },
            Message::Ping(self.nonce),
        ]
    }

    fn handle_message(&self, message: &Message) -> TaskResponse {
        match message {
            Message::Inv(items) if items.iter().any(|i| i.is_block()) => {
                let hashes: Vec<Hash256> = items
                    .iter()
                    .filter(|i| i.is_block() && !self.locator.contains(&i.hash))
                    .map(|i| i.hash)
                    .collect();
                TaskResponse::Completed {
                    send: Vec::new(),
                    result: CompletedTask::BlockHashes(hashes),
                }
            }
            Message::Pong(nonce) if *nonce == self.nonce => TaskResponse::Completed {
                send: Vec::new(),
                result: CompletedTask::BlockHashes(Vec::new()),
            },
            _ => TaskResponse::NotHandled,
        }
    }
}

// =============================================================================
// Merkle blocks
// =============================================================================

#[derive(Debug)]
pub struct GetMerkleBlocksTask {
    block_hashes: Vec<BlockHash>,
    validator: MerkleBlockValidator,
    received: Vec<MerkleBlock>,
    nonce: u64,
}

impl GetMerkleBlocksTask {
    /// The trailing ping is answered after every block and matched
    /// transaction was sent
    fn start(&self) -> Vec<Message> {
        vec![
            Message::GetData(
                self.block_hashes
                    .iter()
                    .map(|h| InventoryItem::new(InventoryType::FilteredBlock, h.header_hash))
                    .collect(),
            ),
            Message::Ping(self.nonce),
        ]
    }

    fn handle_message(&mut self, message: &Message) -> Result<TaskResponse, PeerError> {
        match message {
            Message::MerkleBlock(merkle_block) => {
                let hash = merkle_block.header.hash();
                let Some(requested) = self.block_hashes.iter().find(|h| h.header_hash == hash) else {
                    return Ok(TaskResponse::NotHandled);
                };
                if self.received.iter().any(|b| b.header_hash == hash) {
                    return Ok(TaskResponse::Handled { send: Vec::new() });
                }
                let height = requested.height;
                let mut block = self
                    .validator
                    .validate(merkle_block.clone())
                    .map_err(|e| PeerError::Misbehaving(format!("merkle block {}: {}", hash, e)))?;
                block.height = height;
                self.received.push(block);
                Ok(TaskResponse::Handled { send: Vec::new() })
            }
            Message::Tx(tx) => {
                let taken = self
                    .received
                    .iter_mut()
                    .rev()
                    .any(|block| !block.is_complete() && block.add_transaction(tx.clone()));
                Ok(if taken {
                    TaskResponse::Handled { send: Vec::new() }
                } else {
                    TaskResponse::NotHandled
                })
            }
            Message::Pong(nonce) if *nonce == self.nonce => Ok(TaskResponse::Completed {
                send: Vec::new(),
                result: CompletedTask::MerkleBlocks(self.completed_blocks()),
            }),
            _ => Ok(TaskResponse::NotHandled),
        }
    }

    /// Complete blocks in request order, up to the first missing one
    fn completed_blocks(&mut self) -> Vec<MerkleBlock> {
        let mut received = std::mem::take(&mut self.received);
        let mut blocks = Vec::new();
        for requested in &self.block_hashes {
            let Some(position) = received
                .iter()
                .position(|b| b.header_hash == requested.header_hash && b.is_complete())
            else {
                break;
            };
            blocks.push(received.swap_remove(position));
        }
        blocks
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Debug)]
pub struct SendTransactionTask {
    hash: Hash256,
    transaction: FullTransaction,
}

impl SendTransactionTask {
    fn handle_message(&self, message: &Message) -> TaskResponse {
        match message {
            Message::GetData(items) if items.iter().any(|i| i.is_transaction() && i.hash == self.hash) => {
                TaskResponse::Completed {
                    send: vec![Message::Tx(self.transaction.clone())],
                    result: CompletedTask::TransactionSent(self.hash),
                }
            }
            _ => TaskResponse::NotHandled,
        }
    }
}

#[derive(Debug)]
pub struct RequestTransactionsTask {
    hashes: HashSet<Hash256>,
    received: Vec<FullTransaction>,
}

impl RequestTransactionsTask {
    fn handle_message(&mut self, message: &Message) -> TaskResponse {
        match message {
            Message::Tx(tx) if self.hashes.remove(&tx.hash()) => {
                self.received.push(tx.clone());
            }
            Message::NotFound(items) => {
                let before = self.hashes.len();
                for item in items {
                    self.hashes.remove(&item.hash);
                }
                if before == self.hashes.len() {
                    return TaskResponse::NotHandled;
                }
            }
            _ => return TaskResponse::NotHandled,
        }

        if self.hashes.is_empty() {
            TaskResponse::Completed {
                send: Vec::new(),
                result: CompletedTask::TransactionsReceived(std::mem::take(&mut self.received)),
            }
        } else {
            TaskResponse::Handled { send: Vec::new() }
        }
    }
}
