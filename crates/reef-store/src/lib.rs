//! Miner-bound shard storage for Reef.
//!
//! This crate implements the on-disk layer the sync engine reads from and
//! writes into:
//!
//! - [`encoding`] — the scheme binding stored bytes to a miner and KV index,
//!   and the content commitment over values.
//! - [`StorageFile`] — one fixed-range file with a header and per-entry
//!   slots interleaving the meta record with the encoded value.
//! - [`ShardHandle`] — the union of files covering one shard, with
//!   entry-level read/write operations.
//! - [`ShardRegistry`] — the per-contract directory of hosted shards.

pub mod encoding;
mod error;
mod file;
mod registry;
mod shard;

pub use error::StoreError;
pub use file::StorageFile;
pub use registry::ShardRegistry;
pub use shard::ShardHandle;
