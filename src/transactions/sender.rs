//! Broadcasting transactions and resending unconfirmed ones

use crate::core::FullTransaction;
use crate::network::{PeerGroupHandle, PeerId};
use crate::storage::{SentTransaction, Storage, StorageError};
use crate::transactions::syncer::TransactionSyncer;
use crate::utils::unix_time;
use rand::seq::SliceRandom;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransactionSendError {
    #[error("No connected peers")]
    NoConnectedPeers,
    #[error("Peers are not synced")]
    PeersNotSynced,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Wait,
    Resend,
    Abandon,
}

/// Bounded resending: spacing doubles after every attempt
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Seconds before the first resend
    pub retries_period: i64,
    /// Seconds after the first send when the transaction is given up
    pub total_retries_period: i64,
}

impl RetryPolicy {
    /// Wait after the `retries`-th resend
    pub fn spacing(&self, retries: u32) -> i64 {
        self.retries_period.saturating_mul(1i64 << retries.min(32))
    }

    pub fn decide(&self, sent: &SentTransaction, now: i64) -> RetryDecision {
        if sent.retries_count >= self.max_retries
            || now - sent.first_send_time >= self.total_retries_period
        {
            RetryDecision::Abandon
        } else if now - sent.last_send_time >= self.spacing(sent.retries_count) {
            RetryDecision::Resend
        } else {
            RetryDecision::Wait
        }
    }
}

pub struct TransactionSender {
    syncer: Arc<TransactionSyncer>,
    storage: Arc<dyn Storage>,
    peer_group: PeerGroupHandle,
    policy: RetryPolicy,
}

impl TransactionSender {
    pub fn new(
        syncer: Arc<TransactionSyncer>,
        storage: Arc<dyn Storage>,
        peer_group: PeerGroupHandle,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            syncer,
            storage,
            peer_group,
            policy,
        }
    }

    /// Synced peers a transaction can go to
    pub fn verify_can_send(&self) -> Result<Vec<PeerId>, TransactionSendError> {
        let status = self.peer_group.status();
        if status.connected_peers().is_empty() {
            return Err(TransactionSendError::NoConnectedPeers);
        }
        let synced = status.synced_peers();
        if synced.is_empty() {
            return Err(TransactionSendError::PeersNotSynced);
        }
        Ok(synced)
    }

    pub fn send(&self, tx: &FullTransaction) -> Result<(), TransactionSendError> {
        let peers = self.verify_can_send()?;
        self.dispatch(tx, peers)
    }

    /// Send what was never sent, resend what is due and drop what ran out
    /// of retries. Returns how many transactions went out.
    pub fn send_pending(&self) -> Result<usize, TransactionSendError> {
        let peers = match self.verify_can_send() {
            Ok(peers) => peers,
            Err(TransactionSendError::Storage(e)) => return Err(e.into()),
            Err(_) => return Ok(0),
        };

        let now = unix_time();
        let mut sent_count = 0;
        for tx in self.syncer.pending_transactions()? {
            let hash = tx.hash();
            let decision = match self.storage.sent_transaction(&hash)? {
                None => RetryDecision::Resend,
                Some(sent) => self.policy.decide(&sent, now),
            };
            match decision {
                RetryDecision::Wait => {}
                RetryDecision::Resend => {
                    self.dispatch(&tx, peers.clone())?;
                    sent_count += 1;
                }
                RetryDecision::Abandon => {
                    log::warn!("Giving up on transaction {}", hash);
                    self.syncer.handle_invalid(&hash)?;
                }
            }
        }
        Ok(sent_count)
    }

    fn dispatch(&self, tx: &FullTransaction, mut peers: Vec<PeerId>) -> Result<(), TransactionSendError> {
        let hash = tx.hash();
        let now = unix_time();
        let record = match self.storage.sent_transaction(&hash)? {
            Some(mut sent) => {
                sent.retries_count += 1;
                sent.last_send_time = now;
                sent
            }
            None => SentTransaction::new(hash, now),
        };
        log::info!(
            "Sending transaction {} (attempt {})",
            hash,
            record.retries_count + 1
        );
        self.storage.save_sent_transaction(record)?;

        // half of the synced peers, at least one
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate((peers.len() / 2).max(1));
        self.peer_group.send_transaction(tx.clone(), peers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionStatus;
    use crate::network::{PeerGroupCommand, PeerGroupStatus, PeerStatus};
    use crate::storage::MemoryStorage;
    use crate::test_utils::{incoming_transaction, pending_pipeline, storage_with_keys};
    use tokio::sync::{mpsc, watch};

    const POLICY: RetryPolicy = RetryPolicy {
        max_retries: 3,
        retries_period: 60,
        total_retries_period: 3_600,
    };

    struct Fixture {
        storage: Arc<MemoryStorage>,
        sender: TransactionSender,
        status: watch::Sender<PeerGroupStatus>,
        commands: mpsc::UnboundedReceiver<PeerGroupCommand>,
    }

    fn fixture() -> Fixture {
        let storage = storage_with_keys(2);
        let pipeline = pending_pipeline(storage.clone(), 2);
        let syncer = Arc::new(TransactionSyncer::new(
            storage.clone(),
            pipeline.processor,
            pipeline.invalidator,
            pipeline.bloom,
        ));
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(PeerGroupStatus::default());
        let sender = TransactionSender::new(
            syncer,
            storage.clone(),
            PeerGroupHandle::new(commands_tx, status_rx),
            POLICY,
        );
        Fixture {
            storage,
            sender,
            status,
            commands,
        }
    }

    fn peers(connected: u64, synced: u64) -> PeerGroupStatus {
        PeerGroupStatus {
            peers: (1..=connected)
                .map(|id| PeerStatus {
                    id,
                    address: format!("10.0.0.{}:8333", id),
                    connected: true,
                    synced: id <= synced,
                })
                .collect(),
        }
    }

    fn pending_transaction(storage: &MemoryStorage) -> FullTransaction {
        let key = storage.public_key("0/0/0").unwrap().unwrap();
        let mut tx = incoming_transaction(&key, &[4_000]);
        tx.header.status = TransactionStatus::New;
        storage.add_transaction(tx.clone()).unwrap();
        tx
    }

    #[test]
    fn test_retry_policy() {
        let mut sent = SentTransaction::new(crate::crypto::Hash256::ZERO, 1_000);
        assert_eq!(POLICY.decide(&sent, 1_030), RetryDecision::Wait);
        assert_eq!(POLICY.decide(&sent, 1_060), RetryDecision::Resend);

        sent.retries_count = 2;
        sent.last_send_time = 1_200;
        assert_eq!(POLICY.spacing(2), 240);
        assert_eq!(POLICY.decide(&sent, 1_400), RetryDecision::Wait);
        assert_eq!(POLICY.decide(&sent, 1_440), RetryDecision::Resend);
        assert_eq!(POLICY.decide(&sent, 4_600), RetryDecision::Abandon);

        sent.retries_count = 3;
        assert_eq!(POLICY.decide(&sent, 1_440), RetryDecision::Abandon);
    }

    #[test]
    fn test_verify_can_send() {
        let f = fixture();
        assert!(matches!(
            f.sender.verify_can_send(),
            Err(TransactionSendError::NoConnectedPeers)
        ));
        f.status.send_replace(peers(2, 0));
        assert!(matches!(
            f.sender.verify_can_send(),
            Err(TransactionSendError::PeersNotSynced)
        ));
        f.status.send_replace(peers(3, 2));
        assert_eq!(f.sender.verify_can_send().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_send_goes_to_half_of_synced_peers() {
        let mut f = fixture();
        f.status.send_replace(peers(4, 4));
        let tx = pending_transaction(&f.storage);

        f.sender.send(&tx).unwrap();
        match f.commands.try_recv() {
            Ok(PeerGroupCommand::SendTransaction { transaction, peers }) => {
                assert_eq!(transaction.hash(), tx.hash());
                assert_eq!(peers.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
        let sent = f.storage.sent_transaction(&tx.hash()).unwrap().unwrap();
        assert_eq!(sent.retries_count, 0);
        assert!(!sent.send_success);
    }

    #[test]
    fn test_send_pending() {
        let mut f = fixture();
        let tx = pending_transaction(&f.storage);

        // nobody to send to: nothing happens
        assert_eq!(f.sender.send_pending().unwrap(), 0);

        f.status.send_replace(peers(1, 1));
        assert_eq!(f.sender.send_pending().unwrap(), 1);
        assert!(matches!(
            f.commands.try_recv(),
            Ok(PeerGroupCommand::SendTransaction { .. })
        ));
        // not due yet
        assert_eq!(f.sender.send_pending().unwrap(), 0);

        let mut sent = f.storage.sent_transaction(&tx.hash()).unwrap().unwrap();
        sent.last_send_time -= 60;
        f.storage.save_sent_transaction(sent).unwrap();
        assert_eq!(f.sender.send_pending().unwrap(), 1);
        let sent = f.storage.sent_transaction(&tx.hash()).unwrap().unwrap();
        assert_eq!(sent.retries_count, 1);

        let mut sent = sent;
        sent.first_send_time -= 3_600;
        f.storage.save_sent_transaction(sent).unwrap();
        assert_eq!(f.sender.send_pending().unwrap(), 0);
        assert!(f.storage.transaction(&tx.hash()).unwrap().is_none());
        assert!(f.storage.invalid_transaction(&tx.hash()).unwrap().is_some());
    }
}
