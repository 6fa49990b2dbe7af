//! Fixed-layout storage file backing a contiguous chunk range.
//!
//! Layout:
//!
//! ```text
//! [ header, 4096 bytes ][ meta ][ encoded value ][ meta ][ encoded value ]...
//! ```
//!
//! Each entry slot interleaves the 32-byte metadata record with the
//! `kv_size` bytes of encoded value that follow it; the byte offsets of
//! the meta fields are part of the persisted format. The chunk range must
//! be aligned to whole KV entries so every slot is wholly inside the file.
//! All access goes through `read_at`/`write_at`, so disjoint entries can
//! be written concurrently through a shared reference.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use reef_types::{Address, EncodeType, KvMeta, META_LEN};
use tracing::debug;

use crate::error::StoreError;

const MAGIC: &[u8; 8] = b"REEFKVF\0";
const VERSION: u16 = 1;

/// Size reserved for the header at the start of every file.
pub const HEADER_SIZE: u64 = 4096;

// Header field offsets.
const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_ENCODE_TYPE: u64 = 10;
const OFF_START_CHUNK: u64 = 12;
const OFF_CHUNK_COUNT: u64 = 20;
const OFF_CHUNK_SIZE: u64 = 28;
const OFF_KV_SIZE: u64 = 36;
const OFF_MINER: u64 = 44;
const HEADER_LEN: usize = 64;

/// Parsed header of a storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    start_chunk: u64,
    chunk_count: u64,
    chunk_size: u64,
    kv_size: u64,
    miner: Address,
    encode_type: EncodeType,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[OFF_MAGIC as usize..][..8].copy_from_slice(MAGIC);
        bytes[OFF_VERSION as usize..][..2].copy_from_slice(&VERSION.to_be_bytes());
        bytes[OFF_ENCODE_TYPE as usize] = self.encode_type.as_u8();
        bytes[OFF_START_CHUNK as usize..][..8].copy_from_slice(&self.start_chunk.to_be_bytes());
        bytes[OFF_CHUNK_COUNT as usize..][..8].copy_from_slice(&self.chunk_count.to_be_bytes());
        bytes[OFF_CHUNK_SIZE as usize..][..8].copy_from_slice(&self.chunk_size.to_be_bytes());
        bytes[OFF_KV_SIZE as usize..][..8].copy_from_slice(&self.kv_size.to_be_bytes());
        bytes[OFF_MINER as usize..][..20].copy_from_slice(self.miner.as_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self, StoreError> {
        if &bytes[..8] != MAGIC {
            return Err(StoreError::InvalidHeader("bad magic".into()));
        }
        let version = u16::from_be_bytes(
            bytes[OFF_VERSION as usize..][..2]
                .try_into()
                .expect("fixed range"),
        );
        if version != VERSION {
            return Err(StoreError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        let encode_type = EncodeType::from_u8(bytes[OFF_ENCODE_TYPE as usize]).ok_or_else(|| {
            StoreError::InvalidHeader(format!(
                "unknown encode type {}",
                bytes[OFF_ENCODE_TYPE as usize]
            ))
        })?;

        let read_u64 = |off: u64| {
            u64::from_be_bytes(bytes[off as usize..][..8].try_into().expect("fixed range"))
        };
        let mut miner = [0u8; 20];
        miner.copy_from_slice(&bytes[OFF_MINER as usize..][..20]);

        Ok(Self {
            start_chunk: read_u64(OFF_START_CHUNK),
            chunk_count: read_u64(OFF_CHUNK_COUNT),
            chunk_size: read_u64(OFF_CHUNK_SIZE),
            kv_size: read_u64(OFF_KV_SIZE),
            miner: Address::from(miner),
            encode_type,
        })
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.chunk_size == 0 || self.kv_size == 0 {
            return Err(StoreError::InvalidGeometry(
                "chunk size and kv size must be nonzero".into(),
            ));
        }
        if self.kv_size % self.chunk_size != 0 {
            return Err(StoreError::InvalidGeometry(format!(
                "kv size {} not a multiple of chunk size {}",
                self.kv_size, self.chunk_size
            )));
        }
        let chunks_per_kv = self.kv_size / self.chunk_size;
        if self.start_chunk % chunks_per_kv != 0 || self.chunk_count % chunks_per_kv != 0 {
            return Err(StoreError::InvalidGeometry(format!(
                "chunk range [{}, +{}) not aligned to whole kv entries",
                self.start_chunk, self.chunk_count
            )));
        }
        if self.chunk_count == 0 {
            return Err(StoreError::InvalidGeometry("empty chunk range".into()));
        }
        Ok(())
    }
}

/// One fixed-range storage file.
///
/// Backs the contiguous chunk run `[start_chunk, start_chunk + chunk_count)`
/// and therefore the KV entries whose chunks fall entirely inside it.
pub struct StorageFile {
    file: File,
    path: PathBuf,
    header: Header,
}

impl StorageFile {
    /// Create a new preallocated storage file.
    ///
    /// Fails if the file already exists; existing data is never overwritten.
    pub fn create(
        path: impl AsRef<Path>,
        start_chunk: u64,
        chunk_count: u64,
        chunk_size: u64,
        kv_size: u64,
        miner: Address,
        encode_type: EncodeType,
    ) -> Result<Self, StoreError> {
        let header = Header {
            start_chunk,
            chunk_count,
            chunk_size,
            kv_size,
            miner,
            encode_type,
        };
        header.validate()?;

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let kv_count = chunk_count / (kv_size / chunk_size);
        let total = HEADER_SIZE + kv_count * (META_LEN as u64 + kv_size);
        file.set_len(total)?;
        file.write_all_at(&header.to_bytes(), 0)?;
        file.sync_all()?;

        debug!(
            path = %path.display(),
            start_chunk,
            chunk_count,
            %miner,
            "created storage file"
        );

        Ok(Self { file, path, header })
    }

    /// Open an existing storage file and validate its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut bytes = [0u8; HEADER_LEN];
        file.read_exact_at(&mut bytes, 0)?;
        let header = Header::from_bytes(&bytes)?;
        header.validate()?;

        let kv_count = header.chunk_count / (header.kv_size / header.chunk_size);
        let expected = HEADER_SIZE + kv_count * (META_LEN as u64 + header.kv_size);
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(StoreError::InvalidHeader(format!(
                "file truncated: {actual} bytes, header implies {expected}"
            )));
        }

        Ok(Self { file, path, header })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Miner address the stored bytes are bound to.
    pub fn miner(&self) -> Address {
        self.header.miner
    }

    /// Encoding scheme of the stored bytes.
    pub fn encode_type(&self) -> EncodeType {
        self.header.encode_type
    }

    /// First chunk index covered by this file.
    pub fn start_chunk(&self) -> u64 {
        self.header.start_chunk
    }

    /// Number of chunks covered by this file.
    pub fn chunk_count(&self) -> u64 {
        self.header.chunk_count
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.header.chunk_size
    }

    /// Physical per-entry slot size in bytes.
    pub fn kv_size(&self) -> u64 {
        self.header.kv_size
    }

    /// First KV index backed by this file.
    pub fn first_kv(&self) -> u64 {
        self.header.start_chunk / (self.header.kv_size / self.header.chunk_size)
    }

    /// Number of KV entries backed by this file.
    pub fn kv_count(&self) -> u64 {
        self.header.chunk_count / (self.header.kv_size / self.header.chunk_size)
    }

    /// Whether the given KV index falls inside this file's range.
    pub fn contains_kv(&self, kv_idx: u64) -> bool {
        kv_idx >= self.first_kv() && kv_idx < self.first_kv() + self.kv_count()
    }

    fn local_index(&self, kv_idx: u64) -> Result<u64, StoreError> {
        if !self.contains_kv(kv_idx) {
            return Err(StoreError::OutOfRange(kv_idx));
        }
        Ok(kv_idx - self.first_kv())
    }

    fn meta_offset(&self, local: u64) -> u64 {
        HEADER_SIZE + local * (META_LEN as u64 + self.header.kv_size)
    }

    fn payload_offset(&self, local: u64) -> u64 {
        self.meta_offset(local) + META_LEN as u64
    }

    /// Read the metadata record for an entry.
    pub fn read_meta(&self, kv_idx: u64) -> Result<KvMeta, StoreError> {
        let local = self.local_index(kv_idx)?;
        let mut bytes = [0u8; META_LEN];
        self.file.read_exact_at(&mut bytes, self.meta_offset(local))?;
        Ok(KvMeta::from(bytes))
    }

    /// Write the metadata record for an entry.
    pub fn write_meta(&self, kv_idx: u64, meta: KvMeta) -> Result<(), StoreError> {
        let local = self.local_index(kv_idx)?;
        self.file.write_all_at(meta.as_bytes(), self.meta_offset(local))?;
        Ok(())
    }

    /// Read up to `max_len` encoded payload bytes of an entry.
    pub fn read_payload(&self, kv_idx: u64, max_len: u64) -> Result<Vec<u8>, StoreError> {
        let local = self.local_index(kv_idx)?;
        let len = max_len.min(self.header.kv_size) as usize;
        let mut bytes = vec![0u8; len];
        self.file.read_exact_at(&mut bytes, self.payload_offset(local))?;
        Ok(bytes)
    }

    /// Write the full encoded payload of an entry.
    pub fn write_payload(&self, kv_idx: u64, encoded: &[u8]) -> Result<(), StoreError> {
        let local = self.local_index(kv_idx)?;
        if encoded.len() as u64 != self.header.kv_size {
            return Err(StoreError::SizeMismatch {
                len: encoded.len(),
                max: self.header.kv_size,
            });
        }
        self.file.write_all_at(encoded, self.payload_offset(local))?;
        Ok(())
    }
}

impl std::fmt::Debug for StorageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFile")
            .field("path", &self.path)
            .field("start_chunk", &self.header.start_chunk)
            .field("chunk_count", &self.header.chunk_count)
            .field("miner", &self.header.miner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn miner() -> Address {
        Address::from([0x11u8; 20])
    }

    fn make_file(dir: &TempDir) -> StorageFile {
        // 4 chunks per kv, 8 entries.
        StorageFile::create(
            dir.path().join("shard-0.dat"),
            0,
            32,
            1024,
            4096,
            miner(),
            EncodeType::MinerMask,
        )
        .unwrap()
    }

    #[test]
    fn test_create_open_preserves_header() {
        let dir = TempDir::new().unwrap();
        let file = make_file(&dir);
        let path = file.path().to_path_buf();
        drop(file);

        let reopened = StorageFile::open(&path).unwrap();
        assert_eq!(reopened.start_chunk(), 0);
        assert_eq!(reopened.chunk_count(), 32);
        assert_eq!(reopened.chunk_size(), 1024);
        assert_eq!(reopened.kv_size(), 4096);
        assert_eq!(reopened.miner(), miner());
        assert_eq!(reopened.encode_type(), EncodeType::MinerMask);
        assert_eq!(reopened.kv_count(), 8);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let _file = make_file(&dir);
        let again = StorageFile::create(
            dir.path().join("shard-0.dat"),
            0,
            32,
            1024,
            4096,
            miner(),
            EncodeType::MinerMask,
        );
        assert!(again.is_err());
    }

    #[test]
    fn test_create_rejects_unaligned_range() {
        let dir = TempDir::new().unwrap();
        // 4 chunks per kv, but the range starts mid-entry.
        let result = StorageFile::create(
            dir.path().join("bad.dat"),
            2,
            32,
            1024,
            4096,
            miner(),
            EncodeType::MinerMask,
        );
        assert!(matches!(result, Err(StoreError::InvalidGeometry(_))));
    }

    #[test]
    fn test_meta_roundtrip_and_unwritten_default() {
        let dir = TempDir::new().unwrap();
        let file = make_file(&dir);

        // Unwritten entries read back as the unfilled record.
        assert_eq!(file.read_meta(3).unwrap(), KvMeta::unfilled());

        let meta = KvMeta::filled(&[0x5au8; 24]);
        file.write_meta(3, meta).unwrap();
        assert_eq!(file.read_meta(3).unwrap(), meta);
        // Neighbors are untouched.
        assert_eq!(file.read_meta(2).unwrap(), KvMeta::unfilled());
        assert_eq!(file.read_meta(4).unwrap(), KvMeta::unfilled());
    }

    #[test]
    fn test_payload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = make_file(&dir);

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 255) as u8).collect();
        file.write_payload(5, &payload).unwrap();
        assert_eq!(file.read_payload(5, 4096).unwrap(), payload);
        assert_eq!(file.read_payload(5, 16).unwrap(), &payload[..16]);
    }

    #[test]
    fn test_payload_rejects_wrong_length() {
        let dir = TempDir::new().unwrap();
        let file = make_file(&dir);
        let result = file.write_payload(0, &[0u8; 100]);
        assert!(matches!(result, Err(StoreError::SizeMismatch { .. })));
    }

    #[test]
    fn test_out_of_range_index() {
        let dir = TempDir::new().unwrap();
        let file = make_file(&dir);
        assert!(file.contains_kv(7));
        assert!(!file.contains_kv(8));
        assert!(matches!(file.read_meta(8), Err(StoreError::OutOfRange(8))));
        assert!(matches!(
            file.write_payload(100, &[0u8; 4096]),
            Err(StoreError::OutOfRange(100))
        ));
    }

    #[test]
    fn test_nonzero_start_chunk_maps_indices() {
        let dir = TempDir::new().unwrap();
        // Second shard: chunks [32, 64), entries [8, 16).
        let file = StorageFile::create(
            dir.path().join("shard-1.dat"),
            32,
            32,
            1024,
            4096,
            miner(),
            EncodeType::MinerMask,
        )
        .unwrap();

        assert_eq!(file.first_kv(), 8);
        assert!(file.contains_kv(8));
        assert!(file.contains_kv(15));
        assert!(!file.contains_kv(7));
        assert!(!file.contains_kv(16));

        file.write_meta(8, KvMeta::empty()).unwrap();
        assert_eq!(file.read_meta(8).unwrap(), KvMeta::empty());
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-a-store.dat");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        assert!(matches!(
            StorageFile::open(&path),
            Err(StoreError::InvalidHeader(_))
        ));
    }
}
