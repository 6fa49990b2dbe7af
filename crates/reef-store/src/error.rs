//! Error types for shard storage operations.

use reef_types::COMMIT_LEN;

/// Errors that can occur during shard storage operations.
///
/// "Entry absent" is not represented here: read operations return
/// `Ok(None)` for unwritten or unbacked entries so callers can tell
/// "never synced" apart from real failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The KV index falls outside every backing file of the shard.
    ///
    /// This is a provisioning or programmer error, fatal for the request.
    #[error("kv index {0} outside any backing file")]
    OutOfRange(u64),

    /// The value exceeds the configured per-entry size.
    #[error("value size mismatch: {len} bytes, limit {max}")]
    SizeMismatch {
        /// Size the caller supplied.
        len: usize,
        /// Maximum logical value size.
        max: u64,
    },

    /// The decoded value's commitment disagrees with the expected one.
    ///
    /// Never fatal for sync: the scheduler redirects the index to its
    /// heal set instead of persisting the payload.
    #[error("integrity mismatch for kv {kv_idx}: expected {expected:02x?}, computed {actual:02x?}")]
    IntegrityMismatch {
        /// The index that failed verification.
        kv_idx: u64,
        /// The expected truncated commitment.
        expected: [u8; COMMIT_LEN],
        /// The commitment computed from the decoded bytes.
        actual: [u8; COMMIT_LEN],
    },

    /// A file header or chunk range is inconsistent with the shard geometry.
    #[error("invalid storage geometry: {0}")]
    InvalidGeometry(String),

    /// The file on disk does not carry a valid Reef storage header.
    #[error("invalid file header: {0}")]
    InvalidHeader(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
