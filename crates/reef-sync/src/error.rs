//! Error types for the sync scheduler.

use reef_types::Contract;

/// Errors that can occur while synchronizing shards.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Failed to access the shard storage layer.
    #[error("store error: {0}")]
    Store(#[from] reef_store::StoreError),

    /// Failed to talk to a peer.
    #[error("network error: {0}")]
    Net(#[from] reef_net::NetError),

    /// Failed to access the sync progress store.
    #[error("progress store error: {0}")]
    Progress(#[from] fjall::Error),

    /// Failed to encode or decode a persisted snapshot.
    #[error("snapshot codec error: {0}")]
    Codec(String),

    /// The metadata source could not be reached at all.
    #[error("metadata source error: {0}")]
    Metadata(String),

    /// A sync was requested for a shard this node does not host.
    #[error("shard not registered: contract {contract}, shard {shard_index}")]
    ShardNotRegistered {
        /// The contract of the missing shard.
        contract: Contract,
        /// The shard index.
        shard_index: u64,
    },
}
