//! Sync protocol on iroh QUIC.
//!
//! This crate implements Reef's peer-to-peer sync layer:
//!
//! - [`SyncMessage`] — the wire protocol (postcard-serialized).
//! - [`QuicTransport`] — manages an iroh [`Endpoint`], connection pooling,
//!   the shard-advertisement handshake, and request/response streams.
//! - [`SyncResponder`] — answers range and list requests read-only against
//!   the local [`ShardRegistry`](reef_store::ShardRegistry).
//!
//! [`Endpoint`]: iroh::Endpoint

mod error;
mod message;
mod responder;
mod transport;

pub use error::NetError;
pub use message::{KV_PAYLOAD_OVERHEAD, ContractShards, KvPayload, ShardAdvertisement, SyncMessage};
pub use responder::SyncResponder;
pub use transport::QuicTransport;

use reef_types::{Contract, PeerId};

/// Trait abstracting the two outbound sync requests the scheduler issues.
///
/// This allows substituting a mock transport in tests (avoiding the need
/// for real QUIC endpoints and network access).
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    /// Request encoded entries for `[origin, origin + limit)` of a shard.
    ///
    /// The peer omits entries it does not hold and truncates to its
    /// response byte budget; the caller must detect gaps itself.
    async fn request_range(
        &self,
        peer: PeerId,
        contract: Contract,
        shard_index: u64,
        origin: u64,
        limit: u64,
    ) -> Result<Vec<KvPayload>, NetError>;

    /// Request encoded entries for exactly the given indices.
    ///
    /// Same omission policy as [`request_range`](Self::request_range).
    async fn request_list(
        &self,
        peer: PeerId,
        contract: Contract,
        shard_index: u64,
        kv_indices: Vec<u64>,
    ) -> Result<Vec<KvPayload>, NetError>;
}

/// Callbacks the transport invokes as peers come and go.
///
/// Returning `false` from [`peer_connected`](Self::peer_connected) makes
/// the transport refuse the peer and close the connection.
pub trait PeerEvents: Send + Sync {
    /// A peer completed the handshake with the given advertisement.
    fn peer_connected(&self, peer: PeerId, advertisement: &ShardAdvertisement) -> bool;

    /// A previously accepted peer's connection went away.
    fn peer_disconnected(&self, peer: PeerId);
}

/// Default ALPN protocol identifier (no network secret).
pub const SYNC_ALPN: &[u8] = b"reef/sync/0";

/// Derive a network-specific ALPN from a shared secret.
///
/// The ALPN is `reef/sync/0/<first 16 hex chars of blake3(secret)>`.
/// Nodes of different networks get different ALPNs and cannot establish
/// QUIC connections to each other; the TLS handshake itself rejects the
/// mismatch before any application data is exchanged.
pub fn sync_alpn(secret: &[u8]) -> Vec<u8> {
    let hash = blake3::hash(secret);
    let hex = hash.to_hex();
    format!("reef/sync/0/{}", &hex[..16]).into_bytes()
}
