//! Protocol messages for the Reef sync layer.
//!
//! All messages are serialized with postcard over QUIC bi-streams as
//! length-prefixed frames. Requests and responses travel on the same
//! stream; absence of an entry is expressed by omission, never by error.

use std::collections::{BTreeSet, HashMap, HashSet};

use reef_types::{Address, Contract, EncodeType, KvMeta};
use serde::{Deserialize, Serialize};

/// Per-payload framing overhead assumed when deriving batch sizes from a
/// byte budget: index, miner, encode type, commitment, and length prefix.
pub const KV_PAYLOAD_OVERHEAD: u64 = 64;

/// One encoded KV entry as served by a peer.
///
/// The serving host's miner address and encode type travel with the
/// bytes: the requester decodes with the *peer's* parameters, verifies
/// the decoded content, then re-encodes for its own miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPayload {
    /// Global KV index of the entry.
    pub kv_idx: u64,
    /// Miner address the encoded bytes are bound to.
    pub miner: Address,
    /// Encoding scheme of the bytes.
    pub encode_type: EncodeType,
    /// The metadata record the serving host stores for the entry.
    pub meta: KvMeta,
    /// The encoded payload bytes.
    pub encoded: Vec<u8>,
}

impl KvPayload {
    /// Bytes this payload occupies in a response, including framing.
    pub fn wire_size(&self) -> u64 {
        self.encoded.len() as u64 + KV_PAYLOAD_OVERHEAD
    }
}

/// Shards one contract claims to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractShards {
    /// The contract being advertised.
    pub contract: Contract,
    /// Shard indices the peer serves for it.
    pub shard_ids: Vec<u64>,
}

/// The typed shard advertisement exchanged at connection time.
///
/// Malformed or empty advertisements cause the peer to be refused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAdvertisement {
    /// One entry per advertised contract.
    pub entries: Vec<ContractShards>,
}

impl ShardAdvertisement {
    /// Build an advertisement from `(contract, shard_index)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Contract, u64)>) -> Self {
        let mut map: HashMap<Contract, BTreeSet<u64>> = HashMap::new();
        for (contract, shard) in pairs {
            map.entry(contract).or_default().insert(shard);
        }
        let mut entries: Vec<ContractShards> = map
            .into_iter()
            .map(|(contract, shard_ids)| ContractShards {
                contract,
                shard_ids: shard_ids.into_iter().collect(),
            })
            .collect();
        entries.sort_by_key(|e| e.contract);
        Self { entries }
    }

    /// Whether the advertisement is well formed: at least one entry,
    /// no contract repeated, no entry without shards.
    pub fn is_valid(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .all(|e| !e.shard_ids.is_empty() && seen.insert(e.contract))
    }

    /// View as `contract → set of shard indices`.
    pub fn shard_map(&self) -> HashMap<Contract, BTreeSet<u64>> {
        self.entries
            .iter()
            .map(|e| (e.contract, e.shard_ids.iter().copied().collect()))
            .collect()
    }
}

/// Protocol messages exchanged between sync peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// First message on a new connection: the dialer's advertisement.
    Handshake {
        /// Shards the dialer serves.
        advertisement: ShardAdvertisement,
    },

    /// Response to a [`SyncMessage::Handshake`].
    ///
    /// `accepted == false` means the acceptor has no use for the peer
    /// (no overlapping contract) and will close the connection.
    HandshakeAck {
        /// Shards the acceptor serves.
        advertisement: ShardAdvertisement,
        /// Whether the connection will be kept.
        accepted: bool,
    },

    /// Request encoded entries for a contiguous index window of a shard.
    GetKvsByRange {
        /// Contract the shard belongs to.
        contract: Contract,
        /// The shard being synced.
        shard_index: u64,
        /// First KV index requested.
        origin: u64,
        /// Number of indices requested.
        limit: u64,
    },

    /// Request encoded entries for exactly the listed indices.
    GetKvsByList {
        /// Contract the shard belongs to.
        contract: Contract,
        /// The shard being synced.
        shard_index: u64,
        /// The indices to fetch.
        kv_indices: Vec<u64>,
    },

    /// Response to either request kind.
    ///
    /// Holds only the entries the responder actually has, truncated to
    /// its response byte budget. Requesters detect gaps by comparing
    /// against what they asked for.
    Kvs {
        /// The served entries, in ascending index order.
        payloads: Vec<KvPayload>,
    },
}
