//! Peer group
//!
//! One actor task owns every peer, the initial block download and the
//! mempool bookkeeping. Connections, incoming messages and commands from
//! the rest of the kit all arrive as events on its loop, so no peer state
//! is ever shared between tasks.

use crate::bloom::{BloomFilter, BloomFilterListener, BloomFilterManager};
use crate::core::FullTransaction;
use crate::crypto::Hash256;
use crate::network::codec::WireError;
use crate::network::connection::{PeerConnection, PeerConnector};
use crate::network::mempool::MempoolTransactions;
use crate::network::message::{InventoryItem, InventoryType, Message};
use crate::network::peer::{Peer, PeerError, PeerId, TaskEvent};
use crate::network::tasks::{CompletedTask, PeerTask, TaskTimeout};
use crate::storage::{PeerAddress, Storage};
use crate::sync::{BlockSyncer, InitialBlockDownload, SyncAction};
use crate::transactions::TransactionSyncer;
use crate::utils::unix_time;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PeerGroupConfig {
    /// Connections kept open
    pub peer_size: usize,
    /// Tried when the address book runs dry
    pub seed_peers: Vec<String>,
    pub protocol_version: i32,
    pub task_timeout: Duration,
    pub ping_interval: Duration,
    /// Handshake and ping deadline
    pub peer_timeout: Duration,
}

/// Requests from the rest of the kit
#[derive(Debug)]
pub enum PeerGroupCommand {
    SendTransaction {
        transaction: FullTransaction,
        peers: Vec<PeerId>,
    },
    LoadFilter(BloomFilter),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub id: PeerId,
    pub address: String,
    /// Handshake completed
    pub connected: bool,
    pub synced: bool,
}

/// Snapshot published after every change to the peer set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerGroupStatus {
    pub peers: Vec<PeerStatus>,
}

impl PeerGroupStatus {
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.iter().filter(|p| p.connected).map(|p| p.id).collect()
    }

    pub fn synced_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|p| p.connected && p.synced)
            .map(|p| p.id)
            .collect()
    }
}

/// Cloneable front of a running peer group
#[derive(Clone)]
pub struct PeerGroupHandle {
    commands: mpsc::UnboundedSender<PeerGroupCommand>,
    status: watch::Receiver<PeerGroupStatus>,
}

impl PeerGroupHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<PeerGroupCommand>,
        status: watch::Receiver<PeerGroupStatus>,
    ) -> Self {
        Self { commands, status }
    }

    pub fn status(&self) -> PeerGroupStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PeerGroupStatus> {
        self.status.clone()
    }

    pub fn send_transaction(&self, transaction: FullTransaction, peers: Vec<PeerId>) {
        self.command(PeerGroupCommand::SendTransaction { transaction, peers });
    }

    pub fn stop(&self) {
        self.command(PeerGroupCommand::Stop);
    }

    fn command(&self, command: PeerGroupCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("Peer group is not running");
        }
    }
}

impl BloomFilterListener for PeerGroupHandle {
    fn bloom_filter_updated(&self, filter: &BloomFilter) {
        self.command(PeerGroupCommand::LoadFilter(filter.clone()));
    }
}

enum PeerEvent {
    Connected {
        address: String,
        connection: PeerConnection,
    },
    ConnectFailed {
        address: String,
        error: PeerError,
    },
    Message(PeerId, Result<Message, WireError>),
    Closed(PeerId),
}

struct PeerSlot {
    peer: Peer,
    reader: JoinHandle<()>,
    opened: Instant,
}

pub struct PeerGroup {
    config: PeerGroupConfig,
    storage: Arc<dyn Storage>,
    connector: Arc<dyn PeerConnector>,
    block_syncer: Arc<BlockSyncer>,
    transaction_syncer: Arc<TransactionSyncer>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    ibd: InitialBlockDownload,
    mempool: MempoolTransactions,
    peers: HashMap<PeerId, PeerSlot>,
    connecting: HashSet<String>,
    next_id: PeerId,
    commands: mpsc::UnboundedReceiver<PeerGroupCommand>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    status: watch::Sender<PeerGroupStatus>,
}

impl PeerGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PeerGroupConfig,
        storage: Arc<dyn Storage>,
        connector: Arc<dyn PeerConnector>,
        block_syncer: Arc<BlockSyncer>,
        transaction_syncer: Arc<TransactionSyncer>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        ibd: InitialBlockDownload,
    ) -> (Self, PeerGroupHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(PeerGroupStatus::default());
        let group = Self {
            config,
            storage,
            connector,
            block_syncer,
            transaction_syncer,
            bloom_filter_manager,
            ibd,
            mempool: MempoolTransactions::new(),
            peers: HashMap::new(),
            connecting: HashSet::new(),
            next_id: 1,
            commands,
            events_tx,
            events,
            status,
        };
        (group, PeerGroupHandle::new(commands_tx, status_rx))
    }

    /// Event loop; returns on `Stop` or when every handle is dropped
    pub async fn run(mut self) {
        log::info!("Peer group started, {} peers wanted", self.config.peer_size);
        self.connect_more();
        let mut tick = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PeerGroupCommand::Stop) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = tick.tick() => self.handle_tick(),
            }
        }

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.peers.remove(&id) {
                slot.reader.abort();
            }
        }
        self.publish_status();
        log::info!("Peer group stopped");
    }

    fn handle_command(&mut self, command: PeerGroupCommand) {
        match command {
            PeerGroupCommand::SendTransaction { transaction, peers } => {
                for id in peers {
                    if let Some(slot) = self.peers.get_mut(&id).filter(|s| s.peer.is_connected()) {
                        slot.peer.add_task(PeerTask::send_transaction(transaction.clone()));
                    }
                }
            }
            PeerGroupCommand::LoadFilter(filter) => {
                for slot in self.peers.values().filter(|s| s.peer.is_connected()) {
                    slot.peer.send(Message::FilterLoad(filter.clone()));
                }
            }
            PeerGroupCommand::Stop => {}
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    fn connect_more(&mut self) {
        let wanted = self
            .config
            .peer_size
            .saturating_sub(self.peers.len() + self.connecting.len());
        if wanted == 0 {
            return;
        }

        let mut exclude: Vec<String> = self.peers.values().map(|s| s.peer.address.clone()).collect();
        exclude.extend(self.connecting.iter().cloned());

        let mut addresses: Vec<String> = match self.storage.peer_addresses(&exclude, wanted) {
            Ok(known) => known.into_iter().map(|a| a.ip).collect(),
            Err(e) => {
                log::warn!("Could not read peer addresses: {}", e);
                Vec::new()
            }
        };
        for seed in &self.config.seed_peers {
            if addresses.len() >= wanted {
                break;
            }
            if !exclude.contains(seed) && !addresses.contains(seed) {
                addresses.push(seed.clone());
            }
        }

        for address in addresses {
            self.connecting.insert(address.clone());
            let connector = self.connector.clone();
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let event = match connector.connect(&address).await {
                    Ok(connection) => PeerEvent::Connected { address, connection },
                    Err(error) => PeerEvent::ConnectFailed { address, error },
                };
                let _ = events.send(event);
            });
        }
    }

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { address, connection } => self.add_peer(address, connection),
            PeerEvent::ConnectFailed { address, error } => {
                self.connecting.remove(&address);
                log::info!("Could not connect to {}: {}", address, error);
                if let Err(e) = self.storage.delete_peer_address(&address) {
                    log::warn!("Could not forget peer address {}: {}", address, e);
                }
            }
            PeerEvent::Message(id, Ok(message)) => self.handle_message(id, message),
            PeerEvent::Message(id, Err(e)) => self.disconnect(id, PeerError::Wire(e)),
            PeerEvent::Closed(id) => self.disconnect(id, PeerError::Disconnected),
        }
    }

    fn add_peer(&mut self, address: String, connection: PeerConnection) {
        self.connecting.remove(&address);
        let id = self.next_id;
        self.next_id += 1;

        let PeerConnection { outgoing, mut incoming } = connection;
        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(item) = incoming.recv().await {
                if events.send(PeerEvent::Message(id, item)).is_err() {
                    return;
                }
            }
            let _ = events.send(PeerEvent::Closed(id));
        });

        if let Err(e) = self.storage.set_peer_connection_time(&address, unix_time()) {
            log::debug!("Could not record connection time of {}: {}", address, e);
        }
        let peer = Peer::new(id, address, outgoing, self.config.task_timeout);
        let best_height = self.block_syncer.local_download_best_height().unwrap_or_else(|e| {
            log::warn!("Could not read best height: {}", e);
            0
        });
        peer.send_version(best_height, self.config.protocol_version);
        self.peers.insert(
            id,
            PeerSlot {
                peer,
                reader,
                opened: Instant::now(),
            },
        );
        self.publish_status();
    }

    fn disconnect(&mut self, id: PeerId, error: PeerError) {
        let Some(mut slot) = self.peers.remove(&id) else {
            return;
        };
        slot.reader.abort();
        let address = slot.peer.address.clone();
        log::info!("Peer {} disconnected: {}", address, error);

        if error.is_misbehaviour() {
            if let Err(e) = self.storage.delete_peer_address(&address) {
                log::warn!("Could not forget peer address {}: {}", address, e);
            }
        }
        self.mempool.remove_peer(id);

        for task in slot.peer.take_queued_tasks() {
            if !matches!(task, PeerTask::SendTransaction(_)) {
                continue;
            }
            if let Some(other) = self.peers.values_mut().find(|s| s.peer.is_connected()) {
                other.peer.add_task(task);
            }
        }

        let actions = self.ibd.peer_disconnected(id);
        self.apply(actions);
        self.publish_status();
    }

    fn handle_tick(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(slot) = self.peers.get_mut(&id) else {
                continue;
            };
            if !slot.peer.is_connected() {
                if slot.opened.elapsed() >= self.config.peer_timeout {
                    self.disconnect(id, PeerError::Timeout("handshake".to_string()));
                }
                continue;
            }

            match slot.peer.check_task_timeout() {
                Some(TaskTimeout::Failed(e)) => {
                    self.disconnect(id, e);
                    continue;
                }
                Some(TaskTimeout::Completed(result)) => self.task_completed(id, result),
                None => {}
            }

            if let Some(slot) = self.peers.get_mut(&id) {
                if let Err(e) = slot
                    .peer
                    .check_alive(self.config.ping_interval, self.config.peer_timeout)
                {
                    self.disconnect(id, e);
                }
            }
        }
        self.connect_more();
    }

    // =========================================================================
    // Messages
    // =========================================================================

    fn handle_message(&mut self, id: PeerId, message: Message) {
        let Some(slot) = self.peers.get_mut(&id) else {
            return;
        };
        let peer = &mut slot.peer;
        peer.touch();
        log::trace!("<- {} {}", peer.address, message.command());
        if let Message::Pong(nonce) = &message {
            if peer.handle_pong(*nonce) {
                return;
            }
        }

        match message {
            Message::Version(version) => match peer.handle_version(version) {
                Ok(true) => self.peer_connected(id),
                Ok(false) => {}
                Err(e) => self.disconnect(id, e),
            },
            Message::VerAck => {
                if peer.handle_verack() {
                    self.peer_connected(id);
                }
            }
            Message::Ping(nonce) => peer.send(Message::Pong(nonce)),
            message => {
                if !peer.is_connected() {
                    log::debug!("Ignoring {} before handshake from {}", message.command(), peer.address);
                    return;
                }
                match peer.handle_task_message(&message) {
                    Ok(TaskEvent::Handled) => {}
                    Ok(TaskEvent::Completed(result)) => self.task_completed(id, result),
                    Ok(TaskEvent::Unhandled) => self.handle_unsolicited(id, message),
                    Err(e) => self.disconnect(id, e),
                }
            }
        }
    }

    fn peer_connected(&mut self, id: PeerId) {
        let Some(slot) = self.peers.get(&id) else {
            return;
        };
        if let Some(filter) = self.bloom_filter_manager.bloom_filter() {
            slot.peer.send(Message::FilterLoad(filter));
        }
        let announced_height = slot.peer.announced_height();
        let actions = self.ibd.peer_connected(id, announced_height);
        self.apply(actions);
        self.publish_status();
    }

    fn task_completed(&mut self, id: PeerId, result: CompletedTask) {
        let actions = match result {
            CompletedTask::BlockHashes(hashes) => self.ibd.handle_block_hashes(id, hashes),
            CompletedTask::MerkleBlocks(blocks) => self.ibd.handle_merkle_blocks(id, blocks),
            CompletedTask::TransactionSent(hash) => {
                self.transaction_sent(&hash);
                Vec::new()
            }
            CompletedTask::TransactionsReceived(transactions) => {
                self.transactions_received(transactions);
                Vec::new()
            }
        };
        self.apply(actions);

        if self.peers.get(&id).map_or(false, |s| s.peer.is_ready()) {
            let actions = self.ibd.peer_idle(id);
            self.apply(actions);
        }
    }

    fn transaction_sent(&self, hash: &Hash256) {
        log::info!("Transaction {} handed to a peer", hash);
        match self.storage.sent_transaction(hash) {
            Ok(Some(mut sent)) => {
                sent.send_success = true;
                if let Err(e) = self.storage.save_sent_transaction(sent) {
                    log::warn!("Could not record sent transaction {}: {}", hash, e);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Could not read sent transaction {}: {}", hash, e),
        }
    }

    fn transactions_received(&mut self, transactions: Vec<FullTransaction>) {
        for tx in &transactions {
            self.mempool.remove(&tx.hash());
        }
        if let Err(e) = self.transaction_syncer.handle_relayed(transactions) {
            log::error!("Could not process relayed transactions: {}", e);
        }
    }

    fn handle_unsolicited(&mut self, id: PeerId, message: Message) {
        match message {
            Message::Inv(items) => self.handle_inventory(id, items),
            Message::Tx(tx) => self.transactions_received(vec![tx]),
            Message::GetData(items) => {
                let Some(slot) = self.peers.get(&id) else {
                    return;
                };
                for item in items.iter().filter(|i| i.is_transaction()) {
                    match self.storage.full_transaction(&item.hash) {
                        Ok(Some(tx)) if tx.header.is_pending() && tx.header.is_outgoing => {
                            slot.peer.send(Message::Tx(tx));
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("Could not read transaction {}: {}", item.hash, e),
                    }
                }
            }
            Message::Addr(entries) => {
                let addresses = entries
                    .into_iter()
                    .map(|(_, address)| PeerAddress::new(address.socket_addr().to_string()))
                    .collect();
                if let Err(e) = self.storage.add_peer_addresses(addresses) {
                    log::warn!("Could not store peer addresses: {}", e);
                }
            }
            Message::Reject(reject) => log::warn!(
                "Peer {} rejected {}: {} ({})",
                id,
                reject.message,
                reject.reason,
                reject.code
            ),
            other => log::debug!("Unhandled {} from peer {}", other.command(), id),
        }
    }

    fn handle_inventory(&mut self, id: PeerId, items: Vec<InventoryItem>) {
        let mut blocks = Vec::new();
        let mut transactions = Vec::new();
        for item in items {
            match item.inv_type {
                InventoryType::Block | InventoryType::FilteredBlock => {
                    match self.block_syncer.should_request(&item.hash) {
                        Ok(true) => blocks.push(item.hash),
                        Ok(false) => {}
                        Err(e) => log::warn!("Could not check block {}: {}", item.hash, e),
                    }
                }
                InventoryType::Tx | InventoryType::WitnessTx => {
                    match self.transaction_syncer.should_request_transaction(&item.hash) {
                        Ok(true) => transactions.push(item.hash),
                        Ok(false) => {}
                        Err(e) => log::warn!("Could not check transaction {}: {}", item.hash, e),
                    }
                }
                _ => {}
            }
        }

        if !blocks.is_empty() {
            let actions = self.ibd.handle_block_inventory(id, &blocks);
            self.apply(actions);
        }

        let claimed = self.mempool.claim(id, transactions);
        if !claimed.is_empty() {
            if let Some(slot) = self.peers.get_mut(&id) {
                slot.peer.add_task(PeerTask::request_transactions(claimed));
            }
        }
    }

    // =========================================================================
    // Sync actions and status
    // =========================================================================

    fn apply(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::Assign(id, task) => {
                    if let Some(slot) = self.peers.get_mut(&id) {
                        slot.peer.add_task(task);
                    }
                }
                SyncAction::Send(id, message) => {
                    if let Some(slot) = self.peers.get(&id) {
                        slot.peer.send(message);
                    }
                }
                SyncAction::PeerSynced(id) => {
                    if let Some(slot) = self.peers.get(&id) {
                        if let Err(e) = self.storage.increase_peer_address_score(&slot.peer.address) {
                            log::debug!("Could not score {}: {}", slot.peer.address, e);
                        }
                    }
                    self.publish_status();
                }
                SyncAction::Disconnect(id, error) => self.disconnect(id, error),
            }
        }
    }

    fn publish_status(&self) {
        let mut peers: Vec<PeerStatus> = self
            .peers
            .values()
            .map(|slot| PeerStatus {
                id: slot.peer.id,
                address: slot.peer.address.clone(),
                connected: slot.peer.is_connected(),
                synced: self.ibd.is_peer_synced(slot.peer.id),
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        self.status.send_if_modified(|current| {
            if current.peers == peers {
                return false;
            }
            current.peers = peers;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::{channel_connection, RemotePeer};
    use crate::network::message::ServiceFlags;
    use crate::network::peer::tests::remote_version;
    use crate::storage::MemoryStorage;
    use crate::sync::{KitState, KitStateManager, MerkleBlockValidator};
    use crate::test_utils::{block_syncer, incoming_transaction, pending_pipeline};
    use async_trait::async_trait;

    const SEED: &str = "127.0.0.1:18444";

    /// Hands the remote end of every connection to the test
    struct MockConnector {
        remotes: mpsc::UnboundedSender<(String, RemotePeer)>,
    }

    #[async_trait]
    impl PeerConnector for MockConnector {
        async fn connect(&self, address: &str) -> Result<PeerConnection, PeerError> {
            let (connection, remote) = channel_connection();
            let _ = self.remotes.send((address.to_string(), remote));
            Ok(connection)
        }
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        kit_state: Arc<KitStateManager>,
        handle: PeerGroupHandle,
        remotes: mpsc::UnboundedReceiver<(String, RemotePeer)>,
    }

    fn fixture(storage: Arc<MemoryStorage>, seed_peers: Vec<String>) -> Fixture {
        let (syncer, _) = block_syncer(storage.clone(), 2);
        let pipeline = pending_pipeline(storage.clone(), 2);
        pipeline.bloom.regenerate_bloom_filter().unwrap();
        let transaction_syncer = Arc::new(TransactionSyncer::new(
            storage.clone(),
            pipeline.processor,
            pipeline.invalidator,
            pipeline.bloom.clone(),
        ));
        let kit_state = Arc::new(KitStateManager::new(pipeline.events));
        let ibd = InitialBlockDownload::new(
            syncer.clone(),
            kit_state.clone(),
            MerkleBlockValidator::default(),
            70015,
        );
        let (remotes_tx, remotes) = mpsc::unbounded_channel();
        let config = PeerGroupConfig {
            peer_size: 1,
            seed_peers,
            protocol_version: 70015,
            task_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(60),
        };
        let (group, handle) = PeerGroup::new(
            config,
            storage.clone(),
            Arc::new(MockConnector { remotes: remotes_tx }),
            syncer,
            transaction_syncer,
            pipeline.bloom,
            ibd,
        );
        tokio::spawn(group.run());
        Fixture {
            storage,
            kit_state,
            handle,
            remotes,
        }
    }

    async fn next_message(remote: &mut RemotePeer) -> Message {
        tokio::time::timeout(Duration::from_secs(5), remote.received.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    /// Handshake and an empty `getblocks` round; the peer ends up synced
    async fn sync_remote(remote: &mut RemotePeer) {
        assert!(matches!(next_message(remote).await, Message::Version(_)));
        remote.sent_to_us.send(Ok(Message::Version(remote_version(0)))).unwrap();
        remote.sent_to_us.send(Ok(Message::VerAck)).unwrap();
        assert_eq!(next_message(remote).await, Message::VerAck);
        assert!(matches!(next_message(remote).await, Message::FilterLoad(_)));
        assert!(matches!(next_message(remote).await, Message::GetBlocks { .. }));
        let Message::Ping(nonce) = next_message(remote).await else {
            panic!("expected the task ping");
        };
        remote.sent_to_us.send(Ok(Message::Pong(nonce))).unwrap();
        assert_eq!(next_message(remote).await, Message::MemPool);
    }

    #[tokio::test]
    async fn test_handshake_and_sync() {
        let mut f = fixture(Arc::new(MemoryStorage::new()), vec![SEED.to_string()]);
        let (address, mut remote) = f.remotes.recv().await.unwrap();
        assert_eq!(address, SEED);

        sync_remote(&mut remote).await;
        let kit_state = f.kit_state.clone();
        wait_for(|| kit_state.state() == KitState::Synced).await;

        let handle = f.handle.clone();
        wait_for(|| handle.status().synced_peers() == vec![1]).await;
        f.handle.stop();
    }

    #[tokio::test]
    async fn test_relayed_transaction_requested() {
        let mut f = fixture(Arc::new(MemoryStorage::new()), vec![SEED.to_string()]);
        let (_, mut remote) = f.remotes.recv().await.unwrap();
        sync_remote(&mut remote).await;

        let key = f.storage.public_key("0/0/0").unwrap().unwrap();
        let tx = incoming_transaction(&key, &[7_000]);
        remote
            .sent_to_us
            .send(Ok(Message::Inv(vec![InventoryItem::new(InventoryType::Tx, tx.hash())])))
            .unwrap();
        assert_eq!(
            next_message(&mut remote).await,
            Message::GetData(vec![InventoryItem::new(InventoryType::Tx, tx.hash())])
        );
        remote.sent_to_us.send(Ok(Message::Tx(tx.clone()))).unwrap();

        let storage = f.storage.clone();
        wait_for(|| storage.transaction(&tx.hash()).unwrap().is_some()).await;
        f.handle.stop();
    }

    #[tokio::test]
    async fn test_unsuitable_peer_is_forgotten() {
        let storage = Arc::new(MemoryStorage::new());
        storage.add_peer_addresses(vec![PeerAddress::new(SEED)]).unwrap();
        let mut f = fixture(storage, Vec::new());
        let (address, mut remote) = f.remotes.recv().await.unwrap();
        assert_eq!(address, SEED);

        assert!(matches!(next_message(&mut remote).await, Message::Version(_)));
        let mut version = remote_version(0);
        version.services = ServiceFlags::NODE_NETWORK;
        remote.sent_to_us.send(Ok(Message::Version(version))).unwrap();

        let storage = f.storage.clone();
        wait_for(|| storage.peer_addresses(&[], 10).unwrap().is_empty()).await;
        assert!(f.handle.status().peers.is_empty());
        f.handle.stop();
    }
}
