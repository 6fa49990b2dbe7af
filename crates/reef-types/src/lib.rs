//! Shared types and identifiers for Reef.
//!
//! This crate defines the core types used across the Reef workspace:
//! identifiers ([`Contract`], [`Address`], [`PeerId`]), the on-chain KV
//! metadata record ([`KvMeta`]), the encoding scheme selector
//! ([`EncodeType`]), and configuration ([`StorageConfig`], [`SyncConfig`]).

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod events;

pub use events::EventBus;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_addr {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Return the raw byte representation.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x")?;
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_addr!(
    /// Storage-network contract identifier. All shard and KV index spaces
    /// are namespaced by it.
    Contract,
    20
);

define_addr!(
    /// A miner address. Tags storage files and wire payloads so encoded
    /// bytes are bound to the host that produced them.
    Address,
    20
);

define_addr!(
    /// Transport-level peer identity, derived from the peer's endpoint key.
    PeerId,
    32
);

impl PeerId {
    /// Create a peer ID by hashing arbitrary key material with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }
}

// ---------------------------------------------------------------------------
// KV metadata record
// ---------------------------------------------------------------------------

/// Length of the truncated content commitment stored in a [`KvMeta`].
pub const COMMIT_LEN: usize = 24;

/// Length of the full metadata record.
pub const META_LEN: usize = 32;

/// Offset of the flag byte within the record.
const FLAG_OFFSET: usize = COMMIT_LEN;

/// Low bit of the flag byte: the entry has been written (including the
/// legitimate all-zero value for indices beyond the network watermark).
const FLAG_FILLED: u8 = 0b0000_0001;

/// The authoritative 32-byte metadata record for one KV entry.
///
/// Layout: bytes `[0..24]` = truncated content commitment, byte `[24]` =
/// flag byte (low bit = "filled"), bytes `[25..32]` reserved zero. The
/// byte offsets are part of the persisted on-disk format and must not move.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvMeta([u8; META_LEN]);

impl KvMeta {
    /// A filled record carrying the given truncated commitment.
    pub fn filled(commit: &[u8; COMMIT_LEN]) -> Self {
        let mut bytes = [0u8; META_LEN];
        bytes[..COMMIT_LEN].copy_from_slice(commit);
        bytes[FLAG_OFFSET] |= FLAG_FILLED;
        Self(bytes)
    }

    /// The legitimately-empty pattern: zero commitment, filled bit set.
    ///
    /// Written for indices at or beyond the network's last-valid-index
    /// watermark, which exist physically but carry no assigned data.
    pub fn empty() -> Self {
        Self::filled(&[0u8; COMMIT_LEN])
    }

    /// A never-written record (all zero, filled bit clear).
    pub fn unfilled() -> Self {
        Self([0u8; META_LEN])
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; META_LEN] {
        &self.0
    }

    /// The truncated content commitment.
    pub fn commitment(&self) -> &[u8; COMMIT_LEN] {
        self.0[..COMMIT_LEN].try_into().expect("fixed slice length")
    }

    /// Whether the entry has been written.
    pub fn is_filled(&self) -> bool {
        self.0[FLAG_OFFSET] & FLAG_FILLED != 0
    }

    /// Whether this local record satisfies the authoritative `other`.
    ///
    /// An unfilled local slot never matches, even when the commitment
    /// bytes happen to coincide.
    pub fn matches(&self, other: &KvMeta) -> bool {
        self.is_filled() && self.commitment() == other.commitment()
    }
}

impl From<[u8; META_LEN]> for KvMeta {
    fn from(bytes: [u8; META_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for KvMeta {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KvMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KvMeta(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Encoding scheme
// ---------------------------------------------------------------------------

/// Scheme binding physical on-disk bytes to a specific miner and KV index.
///
/// Encoded bytes copied from a host with a different miner address fail to
/// decode, which prevents trivial copy-serving of another host's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncodeType {
    /// Payload stored raw. Only suitable for trusted or test deployments.
    None,
    /// Payload XOR-masked with a keystream derived from the miner address
    /// and the KV index.
    MinerMask,
}

impl EncodeType {
    /// Stable byte tag used in file headers and on the wire.
    pub fn as_u8(self) -> u8 {
        match self {
            EncodeType::None => 0,
            EncodeType::MinerMask => 1,
        }
    }

    /// Parse a header tag back into an encode type.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EncodeType::None),
            1 => Some(EncodeType::MinerMask),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Geometry of a contract's KV space, read from the storage contract at
/// provisioning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum logical value size in bytes. Also the physical slot size.
    pub kv_size: u64,
    /// Chunk size in bytes. Must divide `kv_size`.
    pub chunk_size: u64,
    /// Number of KV entries per shard.
    pub kv_entries_per_shard: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kv_size: 1 << 17,    // 128 KB, one blob
            chunk_size: 1 << 17, // unchunked blobs by default
            kv_entries_per_shard: 1 << 12,
        }
    }
}

impl StorageConfig {
    /// Whether the geometry is internally consistent.
    pub fn is_valid(&self) -> bool {
        self.kv_size > 0
            && self.chunk_size > 0
            && self.kv_entries_per_shard > 0
            && self.kv_size % self.chunk_size == 0
    }

    /// Chunks backing one KV entry.
    pub fn chunks_per_kv(&self) -> u64 {
        self.kv_size / self.chunk_size
    }

    /// Chunks backing one full shard.
    pub fn chunks_per_shard(&self) -> u64 {
        self.chunks_per_kv() * self.kv_entries_per_shard
    }

    /// First chunk index of the given shard.
    pub fn shard_start_chunk(&self, shard_index: u64) -> u64 {
        shard_index * self.chunks_per_shard()
    }

    /// Half-open KV index range covered by the given shard.
    pub fn shard_kv_range(&self, shard_index: u64) -> Range<u64> {
        let first = shard_index * self.kv_entries_per_shard;
        first..first + self.kv_entries_per_shard
    }

    /// Shard that owns the given KV index.
    pub fn shard_of(&self, kv_idx: u64) -> u64 {
        kv_idx / self.kv_entries_per_shard
    }
}

/// Tuning knobs for the sync scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum bytes in a single peer response. Batch sizes are derived
    /// from this divided by the per-entry encoded size.
    pub max_request_bytes: u64,
    /// Maximum concurrent outstanding requests per shard.
    pub max_concurrent_requests: usize,
    /// Milliseconds without a progress event before the sync context is
    /// declared stalled and cancelled.
    pub stall_timeout_ms: u64,
    /// Milliseconds to wait before retrying when no capable peer exists
    /// or the metadata source could not answer.
    pub retry_delay_ms: u64,
    /// Number of KV indices per metadata-source query.
    pub meta_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 4 * 1024 * 1024,
            max_concurrent_requests: 8,
            stall_timeout_ms: 60_000,
            retry_delay_ms: 500,
            meta_batch_size: 4_096,
        }
    }
}

impl SyncConfig {
    /// Stall timeout as a [`Duration`].
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
