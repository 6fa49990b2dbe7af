//! [`PeerShardDirectory`] — per-connection shard coverage.
//!
//! Records which shards each connected peer claims to serve. Records are
//! created when a peer's advertisement is accepted and discarded on
//! disconnect; they are advisory only — a peer may still fail to serve an
//! index it claims.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use reef_net::{PeerEvents, ShardAdvertisement};
use reef_store::ShardRegistry;
use reef_types::{Contract, PeerId};
use tracing::{debug, info};

/// Tracks advertised `(contract, shard)` coverage per connected peer.
pub struct PeerShardDirectory {
    registry: Arc<ShardRegistry>,
    peers: RwLock<HashMap<PeerId, HashMap<Contract, BTreeSet<u64>>>>,
}

impl PeerShardDirectory {
    /// Create a directory judging peer relevance against the local registry.
    pub fn new(registry: Arc<ShardRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Record a peer's advertisement.
    ///
    /// Returns `false` — telling the caller to drop the connection — when
    /// the advertisement is malformed or claims nothing overlapping a
    /// locally tracked contract; uninteresting peers must not consume
    /// resources here.
    pub fn add_peer(&self, peer: PeerId, advertisement: &ShardAdvertisement) -> bool {
        if !advertisement.is_valid() {
            debug!(%peer, "rejecting peer: malformed advertisement");
            return false;
        }

        let shard_map = advertisement.shard_map();
        let relevant = shard_map
            .keys()
            .any(|contract| !self.registry.shards_of(*contract).is_empty());
        if !relevant {
            debug!(%peer, "rejecting peer: no overlapping contract");
            return false;
        }

        let mut peers = self.peers.write().expect("peer directory lock poisoned");
        peers.insert(peer, shard_map);
        info!(%peer, "peer added to shard directory");
        true
    }

    /// Discard a peer's record.
    pub fn remove_peer(&self, peer: PeerId) {
        let mut peers = self.peers.write().expect("peer directory lock poisoned");
        if peers.remove(&peer).is_some() {
            info!(%peer, "peer removed from shard directory");
        }
    }

    /// Peers claiming to serve `(contract, shard_index)`, in stable order.
    pub fn peers_for(&self, contract: Contract, shard_index: u64) -> Vec<PeerId> {
        let peers = self.peers.read().expect("peer directory lock poisoned");
        let mut capable: Vec<PeerId> = peers
            .iter()
            .filter(|(_, shards)| {
                shards
                    .get(&contract)
                    .is_some_and(|set| set.contains(&shard_index))
            })
            .map(|(peer, _)| *peer)
            .collect();
        capable.sort();
        capable
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.read().expect("peer directory lock poisoned").len()
    }

    /// Whether no peers are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerEvents for PeerShardDirectory {
    fn peer_connected(&self, peer: PeerId, advertisement: &ShardAdvertisement) -> bool {
        self.add_peer(peer, advertisement)
    }

    fn peer_disconnected(&self, peer: PeerId) {
        self.remove_peer(peer);
    }
}

impl std::fmt::Debug for PeerShardDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerShardDirectory")
            .field("peers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_store::ShardHandle;
    use reef_types::StorageConfig;

    fn contract(n: u8) -> Contract {
        Contract::from([n; 20])
    }

    fn peer(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    fn directory_hosting(pairs: &[(Contract, u64)]) -> Arc<PeerShardDirectory> {
        let registry = Arc::new(ShardRegistry::new());
        for &(contract, shard) in pairs {
            registry.add_shard(
                ShardHandle::new(contract, shard, StorageConfig::default()).unwrap(),
            );
        }
        PeerShardDirectory::new(registry)
    }

    #[test]
    fn test_accepts_overlapping_peer() {
        let dir = directory_hosting(&[(contract(1), 0)]);
        let ad = ShardAdvertisement::from_pairs([(contract(1), 0), (contract(1), 4)]);
        assert!(dir.add_peer(peer(1), &ad));
        assert_eq!(dir.peers_for(contract(1), 0), vec![peer(1)]);
        assert_eq!(dir.peers_for(contract(1), 4), vec![peer(1)]);
    }

    #[test]
    fn test_rejects_peer_without_overlap() {
        let dir = directory_hosting(&[(contract(1), 0)]);
        let ad = ShardAdvertisement::from_pairs([(contract(2), 0)]);
        assert!(!dir.add_peer(peer(1), &ad));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_rejects_malformed_advertisement() {
        let dir = directory_hosting(&[(contract(1), 0)]);
        assert!(!dir.add_peer(peer(1), &ShardAdvertisement::default()));
    }

    #[test]
    fn test_remove_peer_discards_record() {
        let dir = directory_hosting(&[(contract(1), 0)]);
        let ad = ShardAdvertisement::from_pairs([(contract(1), 0)]);
        assert!(dir.add_peer(peer(1), &ad));
        dir.remove_peer(peer(1));
        assert!(dir.peers_for(contract(1), 0).is_empty());
        // Removing twice is harmless.
        dir.remove_peer(peer(1));
    }

    #[test]
    fn test_peers_for_filters_by_shard() {
        let dir = directory_hosting(&[(contract(1), 0), (contract(1), 1)]);
        assert!(dir.add_peer(peer(1), &ShardAdvertisement::from_pairs([(contract(1), 0)])));
        assert!(dir.add_peer(
            peer(2),
            &ShardAdvertisement::from_pairs([(contract(1), 0), (contract(1), 1)])
        ));

        assert_eq!(dir.peers_for(contract(1), 0), vec![peer(1), peer(2)]);
        assert_eq!(dir.peers_for(contract(1), 1), vec![peer(2)]);
        assert!(dir.peers_for(contract(1), 2).is_empty());
    }

    #[test]
    fn test_reconnect_replaces_advertisement() {
        let dir = directory_hosting(&[(contract(1), 0), (contract(1), 1)]);
        assert!(dir.add_peer(
            peer(1),
            &ShardAdvertisement::from_pairs([(contract(1), 0), (contract(1), 1)])
        ));
        assert!(dir.add_peer(peer(1), &ShardAdvertisement::from_pairs([(contract(1), 1)])));

        assert!(dir.peers_for(contract(1), 0).is_empty());
        assert_eq!(dir.peers_for(contract(1), 1), vec![peer(1)]);
    }
}
