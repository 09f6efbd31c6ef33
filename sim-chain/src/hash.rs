//! Canonical hashing.
//!
//! The simulator hashes values by serialising them to canonical JSON and
//! running the bytes through SHA-256. Using JSON (rather than a binary
//! codec) keeps the hash input identical to the bytes a peer reconstructs
//! from the wire protocol, which matters because every node must agree on
//! block hashes without a shared binary schema version.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length in bytes of a SHA-256 digest.
pub const HASH_LEN: usize = 32;

/// Returns the lower-hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serialises `value` to canonical JSON and returns its SHA-256 hex digest.
///
/// "Canonical" here means: whatever `serde_json::to_vec` produces for the
/// struct's declared field order. Callers must keep field order stable
/// across releases, since it is part of the consensus-visible hash input.
pub fn hash_canonical<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).expect("value must be serializable to canonical JSON");
    sha256_hex(&bytes)
}

/// Returns `true` if `hash` has at least `difficulty` leading hex zero
/// nibbles, e.g. `difficulty = 4` requires a hash starting with `"0000"`.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    if hash.len() < difficulty {
        return false;
    }
    hash.as_bytes()[..difficulty].iter().all(|&b| b == b'0')
}
