//! Announced transactions being fetched from peers
//!
//! Each announced hash is requested from one peer only. When that peer
//! goes away the hash is forgotten, so the next announcement of it is
//! requested again.

use crate::crypto::Hash256;
use crate::network::peer::PeerId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MempoolTransactions {
    requested: HashMap<Hash256, PeerId>,
}

impl MempoolTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self, hash: &Hash256) -> bool {
        self.requested.contains_key(hash)
    }

    /// Claim the hashes not yet requested from anyone for `peer`
    pub fn claim(&mut self, peer: PeerId, hashes: impl IntoIterator<Item = Hash256>) -> Vec<Hash256> {
        let mut claimed = Vec::new();
        for hash in hashes {
            if !self.requested.contains_key(&hash) {
                self.requested.insert(hash, peer);
                claimed.push(hash);
            }
        }
        claimed
    }

    /// The transaction arrived or was reported missing
    pub fn remove(&mut self, hash: &Hash256) {
        self.requested.remove(hash);
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.requested.retain(|_, owner| *owner != peer);
    }

    pub fn len(&self) -> usize {
        self.requested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_hash_claimed_once() {
        let mut mempool = MempoolTransactions::new();
        let a = Hash256::digest(b"a");
        let b = Hash256::digest(b"b");

        assert_eq!(mempool.claim(1, [a]), vec![a]);
        assert_eq!(mempool.claim(2, [a, b]), vec![b]);
        assert!(mempool.is_requested(&a));

        mempool.remove_peer(1);
        assert!(!mempool.is_requested(&a));
        assert_eq!(mempool.claim(2, [a]), vec![a]);

        mempool.remove(&b);
        assert_eq!(mempool.len(), 1);
    }
}
