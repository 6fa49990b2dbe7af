//! [`SyncResponder`] — the server side of the sync protocol.
//!
//! Answers range and list requests read-only against the local shard
//! registry. Entries the node does not hold are omitted, never
//! fabricated; a response is truncated once it would exceed the byte
//! budget. Nothing here has write side effects.

use std::sync::Arc;

use reef_store::ShardRegistry;
use reef_types::{Contract, PeerId};
use tracing::{debug, warn};

use crate::message::{KvPayload, SyncMessage};

/// Read-only request handler for inbound sync streams.
pub struct SyncResponder {
    registry: Arc<ShardRegistry>,
    /// Maximum bytes of payloads in a single response.
    max_response_bytes: u64,
}

impl SyncResponder {
    /// Create a responder over the local registry.
    pub fn new(registry: Arc<ShardRegistry>, max_response_bytes: u64) -> Self {
        Self {
            registry,
            max_response_bytes,
        }
    }

    /// Handle one request message, producing the response to send back.
    ///
    /// Non-request messages yield `None` (the stream is dropped).
    pub fn handle(&self, peer: PeerId, request: SyncMessage) -> Option<SyncMessage> {
        match request {
            SyncMessage::GetKvsByRange {
                contract,
                shard_index,
                origin,
                limit,
            } => {
                let payloads = self.serve_range(contract, shard_index, origin, limit);
                debug!(
                    %peer, %contract, shard = shard_index, origin, limit,
                    served = payloads.len(),
                    "served range request"
                );
                Some(SyncMessage::Kvs { payloads })
            }
            SyncMessage::GetKvsByList {
                contract,
                shard_index,
                kv_indices,
            } => {
                let requested = kv_indices.len();
                let payloads = self.serve_list(contract, shard_index, &kv_indices);
                debug!(
                    %peer, %contract, shard = shard_index, requested,
                    served = payloads.len(),
                    "served list request"
                );
                Some(SyncMessage::Kvs { payloads })
            }
            other => {
                warn!(%peer, "unexpected request message: {other:?}");
                None
            }
        }
    }

    /// Entries for `[origin, origin + limit)`, clamped to the shard range.
    pub fn serve_range(
        &self,
        contract: Contract,
        shard_index: u64,
        origin: u64,
        limit: u64,
    ) -> Vec<KvPayload> {
        let Some(shard) = self.registry.get(contract, shard_index) else {
            return Vec::new();
        };
        let range = shard.kv_range();
        let first = origin.max(range.start);
        let last = origin.saturating_add(limit).min(range.end);

        let mut payloads = Vec::new();
        let mut budget = self.max_response_bytes;
        for kv_idx in first..last {
            match self.read_entry(&shard, kv_idx) {
                Some(payload) => {
                    if payload.wire_size() > budget {
                        break;
                    }
                    budget -= payload.wire_size();
                    payloads.push(payload);
                }
                None => continue,
            }
        }
        payloads
    }

    /// Entries for exactly the requested indices the node holds.
    pub fn serve_list(
        &self,
        contract: Contract,
        shard_index: u64,
        kv_indices: &[u64],
    ) -> Vec<KvPayload> {
        let Some(shard) = self.registry.get(contract, shard_index) else {
            return Vec::new();
        };

        let mut payloads = Vec::new();
        let mut budget = self.max_response_bytes;
        for &kv_idx in kv_indices {
            match self.read_entry(&shard, kv_idx) {
                Some(payload) => {
                    if payload.wire_size() > budget {
                        break;
                    }
                    budget -= payload.wire_size();
                    payloads.push(payload);
                }
                None => continue,
            }
        }
        payloads
    }

    /// Read one entry as a wire payload; `None` when absent or unreadable.
    fn read_entry(&self, shard: &reef_store::ShardHandle, kv_idx: u64) -> Option<KvPayload> {
        let kv_size = shard.config().kv_size;
        let meta = match shard.try_read_meta(kv_idx) {
            Ok(Some(meta)) => meta,
            Ok(None) => return None,
            Err(e) => {
                warn!(kv_idx, error = %e, "failed to read meta, omitting entry");
                return None;
            }
        };
        let encoded = match shard.try_read_encoded(kv_idx, kv_size) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return None,
            Err(e) => {
                warn!(kv_idx, error = %e, "failed to read payload, omitting entry");
                return None;
            }
        };
        let (miner, encode_type) = shard.encoding_params(kv_idx)?;

        Some(KvPayload {
            kv_idx,
            miner,
            encode_type,
            meta,
            encoded,
        })
    }
}

impl std::fmt::Debug for SyncResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncResponder")
            .field("max_response_bytes", &self.max_response_bytes)
            .finish_non_exhaustive()
    }
}
