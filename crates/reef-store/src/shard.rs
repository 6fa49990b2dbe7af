//! [`ShardHandle`] — entry-level access to one shard.
//!
//! A shard is backed by one or more [`StorageFile`]s whose chunk ranges
//! together cover the shard's slice of the KV index space. The handle
//! exposes entry-level operations and delegates to whichever file backs
//! the requested index.

use reef_types::{Address, Contract, EncodeType, KvMeta, StorageConfig};
use tracing::debug;

use crate::encoding::{decode_kv, encode_kv, meta_of, pad_value};
use crate::error::StoreError;
use crate::file::StorageFile;

/// Logical union of the storage files backing one shard.
pub struct ShardHandle {
    contract: Contract,
    shard_index: u64,
    config: StorageConfig,
    /// Backing files, kept sorted by first KV index.
    files: Vec<StorageFile>,
}

impl ShardHandle {
    /// Create an empty handle for `(contract, shard_index)`.
    pub fn new(
        contract: Contract,
        shard_index: u64,
        config: StorageConfig,
    ) -> Result<Self, StoreError> {
        if !config.is_valid() {
            return Err(StoreError::InvalidGeometry(format!(
                "inconsistent storage config: {config:?}"
            )));
        }
        Ok(Self {
            contract,
            shard_index,
            config,
            files: Vec::new(),
        })
    }

    /// Attach a backing file.
    ///
    /// The file's geometry must match the shard's configuration, fall
    /// inside the shard's chunk range, and not overlap a file already
    /// attached.
    pub fn add_file(&mut self, file: StorageFile) -> Result<(), StoreError> {
        if file.chunk_size() != self.config.chunk_size || file.kv_size() != self.config.kv_size {
            return Err(StoreError::InvalidGeometry(format!(
                "file {} geometry does not match shard config",
                file.path().display()
            )));
        }

        let shard_start = self.config.shard_start_chunk(self.shard_index);
        let shard_end = shard_start + self.config.chunks_per_shard();
        let file_end = file.start_chunk() + file.chunk_count();
        if file.start_chunk() < shard_start || file_end > shard_end {
            return Err(StoreError::InvalidGeometry(format!(
                "file chunks [{}, {}) outside shard {} range [{}, {})",
                file.start_chunk(),
                file_end,
                self.shard_index,
                shard_start,
                shard_end
            )));
        }

        for existing in &self.files {
            let existing_end = existing.start_chunk() + existing.chunk_count();
            if file.start_chunk() < existing_end && existing.start_chunk() < file_end {
                return Err(StoreError::InvalidGeometry(format!(
                    "file chunks [{}, {}) overlap [{}, {})",
                    file.start_chunk(),
                    file_end,
                    existing.start_chunk(),
                    existing_end
                )));
            }
        }

        debug!(
            contract = %self.contract,
            shard = self.shard_index,
            path = %file.path().display(),
            "attached storage file"
        );

        self.files.push(file);
        self.files.sort_by_key(StorageFile::start_chunk);
        Ok(())
    }

    /// Contract this shard belongs to.
    pub fn contract(&self) -> Contract {
        self.contract
    }

    /// Index of this shard.
    pub fn shard_index(&self) -> u64 {
        self.shard_index
    }

    /// Storage geometry.
    pub fn config(&self) -> StorageConfig {
        self.config
    }

    /// Half-open KV index range this shard covers.
    pub fn kv_range(&self) -> std::ops::Range<u64> {
        self.config.shard_kv_range(self.shard_index)
    }

    fn file_for(&self, kv_idx: u64) -> Option<&StorageFile> {
        self.files.iter().find(|f| f.contains_kv(kv_idx))
    }

    /// The miner and encode type the backing file uses for `kv_idx`.
    ///
    /// Peers need these parameters to decode bytes served from this shard.
    pub fn encoding_params(&self, kv_idx: u64) -> Option<(Address, EncodeType)> {
        self.file_for(kv_idx).map(|f| (f.miner(), f.encode_type()))
    }

    /// Whether the attached files cover the full shard range with no gaps.
    pub fn is_complete(&self) -> bool {
        let mut next = self.config.shard_start_chunk(self.shard_index);
        let end = next + self.config.chunks_per_shard();
        for file in &self.files {
            if file.start_chunk() != next {
                return false;
            }
            next += file.chunk_count();
        }
        next == end
    }

    /// Encode `value` for this shard's miner and persist payload + meta.
    ///
    /// `meta` is the authoritative record to store alongside the payload;
    /// callers verify content against it before calling.
    pub fn encode_and_write(
        &self,
        kv_idx: u64,
        value: &[u8],
        meta: KvMeta,
    ) -> Result<(), StoreError> {
        if value.len() as u64 > self.config.kv_size {
            return Err(StoreError::SizeMismatch {
                len: value.len(),
                max: self.config.kv_size,
            });
        }
        let file = self.file_for(kv_idx).ok_or(StoreError::OutOfRange(kv_idx))?;

        let padded = pad_value(value, self.config.kv_size);
        let encoded = encode_kv(&padded, kv_idx, file.miner(), file.encode_type());
        file.write_payload(kv_idx, &encoded)?;
        file.write_meta(kv_idx, meta)?;
        Ok(())
    }

    /// Read up to `max_len` encoded bytes without decoding.
    ///
    /// `None` when the index is unbacked or never written — the responder
    /// streams these bytes to peers without spending CPU on decode.
    pub fn try_read_encoded(
        &self,
        kv_idx: u64,
        max_len: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(file) = self.file_for(kv_idx) else {
            return Ok(None);
        };
        if !file.read_meta(kv_idx)?.is_filled() {
            return Ok(None);
        }
        Ok(Some(file.read_payload(kv_idx, max_len)?))
    }

    /// Read the stored metadata record.
    ///
    /// `None` when the index is unbacked or never written.
    pub fn try_read_meta(&self, kv_idx: u64) -> Result<Option<KvMeta>, StoreError> {
        let Some(file) = self.file_for(kv_idx) else {
            return Ok(None);
        };
        let meta = file.read_meta(kv_idx)?;
        Ok(meta.is_filled().then_some(meta))
    }

    /// Read, decode, and verify an entry against `expected`.
    ///
    /// Returns the first `expected_len` bytes of the decoded value, `None`
    /// when the entry is unwritten or unbacked, and
    /// [`StoreError::IntegrityMismatch`] when the decoded content's
    /// commitment disagrees with the expected one.
    pub fn try_read(
        &self,
        kv_idx: u64,
        expected_len: usize,
        expected: &KvMeta,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        if expected_len as u64 > self.config.kv_size {
            return Err(StoreError::SizeMismatch {
                len: expected_len,
                max: self.config.kv_size,
            });
        }
        let Some(file) = self.file_for(kv_idx) else {
            return Ok(None);
        };
        if !file.read_meta(kv_idx)?.is_filled() {
            return Ok(None);
        }

        let encoded = file.read_payload(kv_idx, self.config.kv_size)?;
        let decoded = decode_kv(&encoded, kv_idx, file.miner(), file.encode_type());

        let actual = meta_of(&decoded);
        if actual.commitment() != expected.commitment() {
            return Err(StoreError::IntegrityMismatch {
                kv_idx,
                expected: *expected.commitment(),
                actual: *actual.commitment(),
            });
        }

        let mut value = decoded;
        value.truncate(expected_len);
        Ok(Some(value))
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("contract", &self.contract)
            .field("shard_index", &self.shard_index)
            .field("files", &self.files.len())
            .field("complete", &self.is_complete())
            .finish()
    }
}
