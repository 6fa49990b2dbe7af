//! Seam to the authoritative on-chain metadata provider.

use reef_types::{Contract, KvMeta};

use crate::error::SyncError;

/// Supplies the authoritative per-index metadata and the network's
/// last-valid-index watermark.
///
/// Implementations query the storage contract; tests use an in-memory
/// table. `get_kv_metas` is best-effort: indices the source cannot answer
/// are silently absent from the result and the scheduler treats them as
/// still-deficit, retrying on its next pass.
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    /// Metadata records for the given indices, as of `block`
    /// (`None` = latest). Unanswerable indices are omitted.
    async fn get_kv_metas(
        &self,
        contract: Contract,
        kv_indices: &[u64],
        block: Option<u64>,
    ) -> Result<Vec<(u64, KvMeta)>, SyncError>;

    /// The first KV index with no assigned data, as of `block`
    /// (`None` = latest). Indices at or beyond it are legitimately empty.
    async fn get_last_kv_index(
        &self,
        contract: Contract,
        block: Option<u64>,
    ) -> Result<u64, SyncError>;
}
