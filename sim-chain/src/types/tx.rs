//! Transaction type.
//!
//! Transactions are opaque payloads from the consensus engine's point of
//! view (see `sim_chain::invariants` for the only place their semantics,
//! double-spending, are actually interpreted). Consensus never inspects
//! `sender`/`recipient`/`amount` beyond including them in the block hash.

use serde::{Deserialize, Serialize};

use crate::hash::hash_canonical;

/// A single opaque transaction record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: u64,
    pub recipient: u64,
    pub amount: u64,
    pub nonce: u64,
    pub timestamp: u64,
}

impl Transaction {
    pub fn new(sender: u64, recipient: u64, amount: u64, nonce: u64, timestamp: u64) -> Self {
        Self {
            sender,
            recipient,
            amount,
            nonce,
            timestamp,
        }
    }

    /// Hash of this transaction's canonical JSON encoding, used as its id.
    pub fn id(&self) -> String {
        hash_canonical(self)
    }
}
