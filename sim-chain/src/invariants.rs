//! Offline invariant checks over a finished chain.
//!
//! Consensus treats transactions as opaque payloads (see
//! [`crate::types::tx`]); nothing in the hot path interprets
//! `sender`/`recipient`/`amount`. Double-spend detection is instead an
//! analysis pass run after the fact over a chosen chain, matching how a
//! simulator is expected to validate its own output rather than how a
//! production ledger would enforce balances inline.

use std::collections::HashMap;

use crate::types::Block;

/// A `(sender, nonce)` pair appearing in more than one transaction across
/// the chain, which would allow the same logical transfer to be spent
/// twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleSpend {
    pub sender: u64,
    pub nonce: u64,
    pub first_block_hash: String,
    pub second_block_hash: String,
}

/// Scans `chain` (ordered genesis-first, as returned by
/// `ChainStore::chain_to`) for any sender/nonce pair used more than once.
pub fn check_no_double_spend(chain: &[Block]) -> Vec<DoubleSpend> {
    let mut seen: HashMap<(u64, u64), String> = HashMap::new();
    let mut violations = Vec::new();

    for block in chain {
        for tx in &block.transactions {
            let key = (tx.sender, tx.nonce);
            match seen.get(&key) {
                Some(first_hash) => violations.push(DoubleSpend {
                    sender: tx.sender,
                    nonce: tx.nonce,
                    first_block_hash: first_hash.clone(),
                    second_block_hash: block.hash.clone(),
                }),
                None => {
                    seen.insert(key, block.hash.clone());
                }
            }
        }
    }

    violations
}
