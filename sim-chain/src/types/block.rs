//! Block type and canonical hashing.
//!
//! A block's `hash` field is the SHA-256 hex digest of the canonical JSON
//! encoding of every other field, `nonce` included. All nodes must compute
//! this identically, so the field order here (and therefore the derived
//! `Serialize` impl's output) is part of the consensus contract.

use serde::{Deserialize, Serialize};

use super::Transaction;
use crate::hash::hash_canonical;

/// Fixed seed string hashed into the genesis block so every node derives
/// the same genesis hash without any communication.
const GENESIS_SEED: &str = "consensus-lab-genesis";

/// Hex-encoded `prev_hash` for the genesis block: 64 `'0'` characters.
pub fn genesis_prev_hash() -> String {
    "0".repeat(64)
}

/// A block: header fields plus an ordered transaction list.
///
/// Field order matters: it is the order `serde_json` serialises in, and
/// that serialization is what gets hashed (see `compute_hash`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub prev_hash: String,
    pub transactions: Vec<Transaction>,
    pub proposer_id: u64,
    pub timestamp: u64,
    pub nonce: u64,
    pub hash: String,
}

/// Struct mirroring [`Block`]'s fields *excluding* `hash`, used as the
/// canonical hash input so a block never hashes its own `hash` field.
#[derive(Serialize)]
struct BlockSigningView<'a> {
    height: u64,
    prev_hash: &'a str,
    transactions: &'a [Transaction],
    proposer_id: u64,
    timestamp: u64,
    nonce: u64,
}

impl Block {
    /// Computes the canonical hash of this block's fields (excluding
    /// `hash` itself). This is what `hash` must equal for the block to be
    /// internally consistent (see `sim_chain::chain::store` hash-integrity
    /// checks and tests below).
    pub fn compute_hash(&self) -> String {
        let view = BlockSigningView {
            height: self.height,
            prev_hash: &self.prev_hash,
            transactions: &self.transactions,
            proposer_id: self.proposer_id,
            timestamp: self.timestamp,
            nonce: self.nonce,
        };
        hash_canonical(&view)
    }

    /// Returns `true` if `self.hash` matches the recomputed canonical hash.
    pub fn hash_is_valid(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Builds the fixed genesis block. Deterministic: every node that calls
    /// this produces byte-identical output without any network round trip.
    pub fn genesis() -> Self {
        let mut block = Block {
            height: 0,
            prev_hash: genesis_prev_hash(),
            transactions: Vec::new(),
            proposer_id: 0,
            timestamp: 0,
            nonce: {
                // Fold the fixed seed string into the nonce field so the
                // genesis hash is tied to `GENESIS_SEED` without needing an
                // extra field that every other block would have to carry.
                let seed_hash = crate::hash::sha256_hex(GENESIS_SEED.as_bytes());
                u64::from_str_radix(&seed_hash[..16], 16).unwrap_or(0)
            },
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }
}
