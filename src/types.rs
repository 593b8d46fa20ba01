//! Core types shared across the content store and reference tree.

use sha3::{Digest, Sha3_256};

/// Hash: 256-bit SHA3 digest
pub type Hash = [u8; 32];

/// Timestamp: UNIX seconds (UTC)
pub type Timestamp = i64;

/// The all-zero hash, used for unset digest fields.
pub const EMPTY_HASH: Hash = [0u8; 32];

/// Current UNIX timestamp in seconds (UTC).
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// SHA3-256 of a byte slice.
pub fn sha3_256(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lookup hash identifying one path within one allocation:
/// `SHA3-256(allocation_id + ":" + path)`.
pub fn lookup_hash(allocation_id: &str, path: &str) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(allocation_id.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.finalize().into()
}

/// Hex rendering of a hash, used for shard paths and log fields.
pub fn hash_hex(hash: &Hash) -> String {
    hex::encode(hash)
}
