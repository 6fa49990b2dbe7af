//! [`ShardRegistry`] — the directory of locally hosted shards.
//!
//! An explicit object owned by the node process and handed by reference to
//! the scheduler and the responder; membership changes only at startup and
//! shard-provisioning time, reads happen on every request.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use reef_types::Contract;
use tracing::info;

use crate::shard::ShardHandle;

/// Per-contract registry mapping shard index to its storage handle.
#[derive(Default)]
pub struct ShardRegistry {
    inner: RwLock<HashMap<Contract, BTreeMap<u64, Arc<ShardHandle>>>>,
}

impl ShardRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard handle, replacing any previous handle for the
    /// same `(contract, shard_index)`.
    pub fn add_shard(&self, handle: ShardHandle) -> Arc<ShardHandle> {
        let contract = handle.contract();
        let shard_index = handle.shard_index();
        let handle = Arc::new(handle);

        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner
            .entry(contract)
            .or_default()
            .insert(shard_index, Arc::clone(&handle));

        info!(%contract, shard = shard_index, "registered shard");
        handle
    }

    /// Look up the handle for `(contract, shard_index)`.
    pub fn get(&self, contract: Contract, shard_index: u64) -> Option<Arc<ShardHandle>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.get(&contract)?.get(&shard_index).cloned()
    }

    /// Whether this node hosts the given shard.
    pub fn hosts(&self, contract: Contract, shard_index: u64) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(&contract)
            .is_some_and(|shards| shards.contains_key(&shard_index))
    }

    /// Shard indices hosted for a contract, in ascending order.
    pub fn shards_of(&self, contract: Contract) -> Vec<u64> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(&contract)
            .map(|shards| shards.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All tracked contracts.
    pub fn contracts(&self) -> Vec<Contract> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.keys().copied().collect()
    }

    /// Every hosted `(contract, shard_index)` pair, in canonical order.
    pub fn hosted(&self) -> Vec<(Contract, u64)> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut pairs: Vec<_> = inner
            .iter()
            .flat_map(|(contract, shards)| shards.keys().map(|idx| (*contract, *idx)))
            .collect();
        pairs.sort();
        pairs
    }
}

impl std::fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("registry lock poisoned");
        f.debug_struct("ShardRegistry")
            .field("contracts", &inner.len())
            .field("shards", &inner.values().map(BTreeMap::len).sum::<usize>())
            .finish()
    }
}
