//! Miner-bound KV encoding and content commitments.
//!
//! Encoded bytes are the XOR of the padded value with a BLAKE3 keystream
//! derived from `(miner, kv_index)`. Decoding is the same XOR with the
//! same parameters, so bytes copied from a host with a different miner
//! address decode to garbage and fail commitment verification.

use reef_types::{Address, COMMIT_LEN, EncodeType, KvMeta};

/// Domain separator for the masking keystream.
const MASK_CONTEXT: &[u8] = b"reef/kv-mask/1";

/// XOR `buf` in place with the keystream for `(miner, kv_idx)`.
fn apply_mask(buf: &mut [u8], kv_idx: u64, miner: Address) {
    let mut hasher = blake3::Hasher::new();
    hasher.update(MASK_CONTEXT);
    hasher.update(miner.as_bytes());
    hasher.update(&kv_idx.to_be_bytes());

    let mut mask = vec![0u8; buf.len()];
    hasher.finalize_xof().fill(&mut mask);

    for (b, m) in buf.iter_mut().zip(&mask) {
        *b ^= m;
    }
}

/// Encode a padded value for storage under the given miner.
pub fn encode_kv(padded: &[u8], kv_idx: u64, miner: Address, encode_type: EncodeType) -> Vec<u8> {
    let mut out = padded.to_vec();
    match encode_type {
        EncodeType::None => {}
        EncodeType::MinerMask => apply_mask(&mut out, kv_idx, miner),
    }
    out
}

/// Decode stored or received bytes back into the padded value.
pub fn decode_kv(encoded: &[u8], kv_idx: u64, miner: Address, encode_type: EncodeType) -> Vec<u8> {
    // The mask is an involution, so decoding is the same transformation.
    encode_kv(encoded, kv_idx, miner, encode_type)
}

/// Zero-pad a value to the physical slot size.
///
/// Commitments are computed over the padded buffer so every party hashes
/// the same bytes regardless of the logical value length.
pub fn pad_value(value: &[u8], kv_size: u64) -> Vec<u8> {
    let mut padded = vec![0u8; kv_size as usize];
    padded[..value.len()].copy_from_slice(value);
    padded
}

/// Truncated content commitment over a padded value.
///
/// The all-zero value has the zero commitment by network convention:
/// slots beyond the last-valid-index watermark exist physically but carry
/// no assigned data, and their on-chain record is all zeros.
pub fn commitment_of(padded: &[u8]) -> [u8; COMMIT_LEN] {
    if padded.iter().all(|&b| b == 0) {
        return [0u8; COMMIT_LEN];
    }
    let hash = blake3::hash(padded);
    hash.as_bytes()[..COMMIT_LEN]
        .try_into()
        .expect("fixed slice length")
}

/// The filled metadata record for a padded value.
pub fn meta_of(padded: &[u8]) -> KvMeta {
    KvMeta::filled(&commitment_of(padded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn miner(n: u8) -> Address {
        Address::from([n; 20])
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let kv_size = 4096u64;
        for len in [0usize, 1, 31, 4095, 4096] {
            let value: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let padded = pad_value(&value, kv_size);
            let encoded = encode_kv(&padded, 42, miner(1), EncodeType::MinerMask);
            let decoded = decode_kv(&encoded, 42, miner(1), EncodeType::MinerMask);
            assert_eq!(decoded, padded, "round trip failed for len {len}");
        }
    }

    #[test]
    fn test_mask_binds_to_miner() {
        let padded = pad_value(b"bound to one miner", 256);
        let encoded = encode_kv(&padded, 7, miner(1), EncodeType::MinerMask);
        let decoded = decode_kv(&encoded, 7, miner(2), EncodeType::MinerMask);
        assert_ne!(decoded, padded);
    }

    #[test]
    fn test_mask_binds_to_index() {
        let padded = pad_value(b"bound to one index", 256);
        let encoded = encode_kv(&padded, 7, miner(1), EncodeType::MinerMask);
        let decoded = decode_kv(&encoded, 8, miner(1), EncodeType::MinerMask);
        assert_ne!(decoded, padded);
    }

    #[test]
    fn test_encode_none_is_identity() {
        let padded = pad_value(b"raw", 64);
        assert_eq!(encode_kv(&padded, 3, miner(1), EncodeType::None), padded);
    }

    #[test]
    fn test_zero_value_has_zero_commitment() {
        let padded = pad_value(&[], 1024);
        assert_eq!(commitment_of(&padded), [0u8; COMMIT_LEN]);
        assert_eq!(meta_of(&padded), KvMeta::empty());
    }

    #[test]
    fn test_commitment_is_content_bound() {
        let a = commitment_of(&pad_value(b"value a", 256));
        let b = commitment_of(&pad_value(b"value b", 256));
        assert_ne!(a, b);
        assert_ne!(a, [0u8; COMMIT_LEN]);
    }

    #[test]
    fn test_encoded_differs_from_plain() {
        let padded = pad_value(b"not stored in the clear", 256);
        let encoded = encode_kv(&padded, 11, miner(9), EncodeType::MinerMask);
        assert_ne!(encoded, padded);
    }
}
