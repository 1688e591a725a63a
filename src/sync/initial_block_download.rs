//! Initial block download
//!
//! Picks one connected peer at a time and walks it through block hash
//! discovery and merkle block download until it has nothing new. The
//! peer group executes the returned actions; this type never touches a
//! connection itself.

use crate::network::message::Message;
use crate::network::peer::{PeerError, PeerId};
use crate::network::tasks::PeerTask;
use crate::sync::block_syncer::{BlockSyncer, BlockSyncerError};
use crate::sync::kit_state::KitStateManager;
use crate::sync::merkle_block::{MerkleBlock, MerkleBlockValidator};
use crate::crypto::Hash256;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Block hashes requested per `getdata`
pub const MERKLE_BLOCKS_PER_REQUEST: usize = 500;

/// Work for the peer group
#[derive(Debug)]
pub enum SyncAction {
    Assign(PeerId, PeerTask),
    Send(PeerId, Message),
    /// The peer delivered a full sync; its address earned a point
    PeerSynced(PeerId),
    Disconnect(PeerId, PeerError),
}

#[derive(Debug, Default)]
struct SyncPeer {
    announced_height: u32,
    synced: bool,
    block_hashes_synced: bool,
}

pub struct InitialBlockDownload {
    block_syncer: Arc<BlockSyncer>,
    kit_state: Arc<KitStateManager>,
    validator: MerkleBlockValidator,
    protocol_version: i32,
    peers: BTreeMap<PeerId, SyncPeer>,
    sync_peer: Option<PeerId>,
}

impl InitialBlockDownload {
    pub fn new(
        block_syncer: Arc<BlockSyncer>,
        kit_state: Arc<KitStateManager>,
        validator: MerkleBlockValidator,
        protocol_version: i32,
    ) -> Self {
        Self {
            block_syncer,
            kit_state,
            validator,
            protocol_version,
            peers: BTreeMap::new(),
            sync_peer: None,
        }
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    pub fn is_peer_synced(&self, id: PeerId) -> bool {
        self.peers.get(&id).map_or(false, |p| p.synced)
    }

    /// A strict majority of connected peers has nothing more for us
    pub fn is_synced(&self) -> bool {
        let synced = self.peers.values().filter(|p| p.synced).count();
        synced > 0 && synced * 2 > self.peers.len()
    }

    // =========================================================================
    // Peer lifecycle
    // =========================================================================

    pub fn peer_connected(&mut self, id: PeerId, announced_height: u32) -> Vec<SyncAction> {
        self.peers.insert(
            id,
            SyncPeer {
                announced_height,
                ..SyncPeer::default()
            },
        );
        self.assign_next_sync_peer()
    }

    pub fn peer_disconnected(&mut self, id: PeerId) -> Vec<SyncAction> {
        if self.peers.remove(&id).is_none() {
            return Vec::new();
        }
        if self.sync_peer == Some(id) {
            self.sync_peer = None;
            if let Err(e) = self.block_syncer.download_failed() {
                log::error!("Could not roll back interrupted download: {}", e);
            }
        }
        if self.peers.is_empty() {
            self.kit_state.set_not_synced("no connected peers");
            return Vec::new();
        }
        self.assign_next_sync_peer()
    }

    /// The peer finished its queued tasks
    pub fn peer_idle(&mut self, id: PeerId) -> Vec<SyncAction> {
        if self.sync_peer != Some(id) {
            return Vec::new();
        }
        self.download_next(id)
    }

    /// Unsolicited block announcement
    pub fn handle_block_inventory(&mut self, id: PeerId, hashes: &[Hash256]) -> Vec<SyncAction> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Vec::new();
        };
        peer.announced_height = peer.announced_height.saturating_add(hashes.len() as u32);
        if !peer.synced {
            return Vec::new();
        }
        peer.synced = false;
        peer.block_hashes_synced = false;
        self.assign_next_sync_peer()
    }

    fn assign_next_sync_peer(&mut self) -> Vec<SyncAction> {
        if self.sync_peer.is_some() {
            return Vec::new();
        }
        let Some(id) = self
            .peers
            .iter()
            .find(|(_, p)| !p.synced)
            .map(|(id, _)| *id)
        else {
            self.update_synced_state();
            return Vec::new();
        };

        if let Err(e) = self.block_syncer.prepare_for_download() {
            log::error!("Could not prepare block download: {}", e);
            self.kit_state.set_not_synced(e.to_string());
            return Vec::new();
        }
        log::info!("Syncing with peer {}", id);
        self.sync_peer = Some(id);
        if !self.is_synced() {
            match self.block_syncer.local_download_best_height() {
                Ok(height) => self.kit_state.set_syncing_started(height),
                Err(e) => log::warn!("Could not read best height: {}", e),
            }
        }
        self.download_next(id)
    }

    fn download_next(&mut self, id: PeerId) -> Vec<SyncAction> {
        match self.next_task(id) {
            Ok(Some(task)) => vec![SyncAction::Assign(id, task)],
            Ok(None) => self.peer_synced(id),
            Err(e) => {
                log::error!("Block download from peer {} stopped: {}", id, e);
                self.kit_state.set_not_synced(e.to_string());
                Vec::new()
            }
        }
    }

    fn next_task(&self, id: PeerId) -> Result<Option<PeerTask>, BlockSyncerError> {
        let Some(peer) = self.peers.get(&id) else {
            return Ok(None);
        };
        let hashes = self.block_syncer.block_hashes(MERKLE_BLOCKS_PER_REQUEST)?;
        if !hashes.is_empty() {
            return Ok(Some(PeerTask::get_merkle_blocks(hashes, self.validator.clone())));
        }
        if !peer.block_hashes_synced {
            let locator = self.block_syncer.block_locator_hashes(peer.announced_height)?;
            return Ok(Some(PeerTask::get_block_hashes(locator, self.protocol_version)));
        }
        Ok(None)
    }

    fn peer_synced(&mut self, id: PeerId) -> Vec<SyncAction> {
        if let Err(e) = self.block_syncer.download_completed() {
            log::error!("Could not finish block download: {}", e);
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.synced = true;
        }
        self.sync_peer = None;
        log::info!("Peer {} synced", id);

        let mut actions = vec![SyncAction::Send(id, Message::MemPool), SyncAction::PeerSynced(id)];
        actions.extend(self.assign_next_sync_peer());
        actions
    }

    fn update_synced_state(&self) {
        if self.is_synced() {
            self.kit_state.set_synced();
        }
    }

    // =========================================================================
    // Task results
    // =========================================================================

    pub fn handle_block_hashes(&mut self, id: PeerId, hashes: Vec<Hash256>) -> Vec<SyncAction> {
        if self.sync_peer != Some(id) {
            return Vec::new();
        }
        let added = if hashes.is_empty() {
            Ok(0)
        } else {
            self.block_syncer.add_block_hashes(&hashes)
        };
        match added {
            Ok(0) => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.block_hashes_synced = true;
                }
            }
            Ok(count) => log::debug!("Peer {} announced {} new blocks", id, count),
            Err(e) => {
                log::error!("Could not queue block hashes: {}", e);
                self.kit_state.set_not_synced(e.to_string());
            }
        }
        Vec::new()
    }

    pub fn handle_merkle_blocks(&mut self, id: PeerId, blocks: Vec<MerkleBlock>) -> Vec<SyncAction> {
        if self.sync_peer != Some(id) {
            return Vec::new();
        }
        if blocks.is_empty() {
            return vec![SyncAction::Disconnect(
                id,
                PeerError::Timeout("requested merkle blocks not delivered".to_string()),
            )];
        }

        for block in blocks {
            match self.block_syncer.handle_merkle_block(block) {
                Ok(_) => {}
                Err(BlockSyncerError::Validation(e)) => {
                    log::warn!("Peer {} sent an invalid block: {}", id, e);
                    return vec![SyncAction::Disconnect(id, PeerError::Misbehaving(e.to_string()))];
                }
                Err(e) => {
                    log::error!("Could not handle merkle block: {}", e);
                    self.kit_state.set_not_synced(e.to_string());
                    return Vec::new();
                }
            }
        }

        if let Err(e) = self.block_syncer.download_iteration_completed() {
            log::error!("Could not complete download iteration: {}", e);
        }
        if !self.is_synced() {
            self.report_progress();
        }
        Vec::new()
    }

    fn report_progress(&self) {
        let max_height = self.peers.values().map(|p| p.announced_height).max().unwrap_or(0);
        match self.block_syncer.local_download_best_height() {
            Ok(current) => self.kit_state.set_progress(current, max_height),
            Err(e) => log::warn!("Could not read best height: {}", e),
        }
    }
}
