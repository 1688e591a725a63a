//! Event bus for the embedding application
//!
//! Components hold an `Arc<EventDispatcher>` and emit into it; the
//! application subscribes and receives every event on its own channel
//! until it unsubscribes or drops the receiver.

use crate::core::BlockInfo;
use crate::sync::KitState;
use crate::transactions::{TransactionInfo, WatchedFilter};
use crate::utils::lock;
use crate::wallet::{BalanceInfo, UnspentOutputProvider};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything the kit reports upward
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum KitEvent {
    TransactionsUpdated {
        inserted: Vec<TransactionInfo>,
        updated: Vec<TransactionInfo>,
    },
    TransactionsDeleted { hashes: Vec<String> },
    BalanceUpdated(BalanceInfo),
    LastBlockInfoUpdated(BlockInfo),
    KitStateUpdated(KitState),
    WatchedTransactionFound {
        filter: WatchedFilter,
        transaction_hash: String,
    },
}

pub type SubscriptionId = u64;

/// A subscriber's end of the bus
pub struct Subscription {
    pub id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<KitEvent>,
}

impl Subscription {
    /// Next event; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<KitEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<KitEvent> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Default)]
pub struct EventDispatcher {
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<KitEvent>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).insert(id, sender);
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.subscribers).remove(&id);
    }

    /// Deliver to every subscriber, forgetting those that went away
    pub fn emit(&self, event: KitEvent) {
        lock(&self.subscribers).retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

// =============================================================================
// Balance
// =============================================================================

/// Recomputes the balance after transaction and block events, at most
/// once per debounce window, and reports it when it changed
pub struct BalanceWatcher {
    events: Arc<EventDispatcher>,
    unspent_provider: Arc<UnspentOutputProvider>,
    debounce: Duration,
}

impl BalanceWatcher {
    pub fn new(
        events: Arc<EventDispatcher>,
        unspent_provider: Arc<UnspentOutputProvider>,
        debounce: Duration,
    ) -> Self {
        Self {
            events,
            unspent_provider,
            debounce,
        }
    }

    fn affects_balance(event: &KitEvent) -> bool {
        matches!(
            event,
            KitEvent::TransactionsUpdated { .. }
                | KitEvent::TransactionsDeleted { .. }
                | KitEvent::LastBlockInfoUpdated(_)
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let subscription = self.events.subscribe();
        let last = self.unspent_provider.balance().ok();
        tokio::spawn(self.run(subscription, last))
    }

    async fn run(self, mut subscription: Subscription, mut last: Option<BalanceInfo>) {
        while let Some(event) = subscription.recv().await {
            if !Self::affects_balance(&event) {
                continue;
            }

            // absorb the rest of the burst
            let deadline = tokio::time::sleep(self.debounce);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    next = subscription.recv() => {
                        if next.is_none() {
                            return;
                        }
                    }
                }
            }

            match self.unspent_provider.balance() {
                Ok(balance) if last != Some(balance) => {
                    last = Some(balance);
                    log::debug!("Balance updated: {:?}", balance);
                    self.events.emit(KitEvent::BalanceUpdated(balance));
                }
                Ok(_) => {}
                Err(e) => log::warn!("Failed to compute balance: {}", e),
            }
        }
    }
}
