//! In-memory transaction pool and a synthetic transaction generator.
//!
//! Consensus does not care how transactions arrive; it only needs a way to
//! ask for a batch that fits into a block.

use std::collections::VecDeque;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::types::Transaction;

/// Abstract transaction source for block production.
pub trait TxPool: Send + Sync {
    /// Selects up to `max_txs` transactions for inclusion in a block. The
    /// selected transactions are removed from the pool.
    fn select_for_block(&mut self, max_txs: usize) -> Vec<Transaction>;

    /// Adds a transaction to the pool (e.g. synthesized locally, or
    /// received from a peer in a future protocol extension).
    fn submit(&mut self, tx: Transaction);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO, unbounded in-memory pool.
#[derive(Default)]
pub struct InMemoryTxPool {
    queue: VecDeque<Transaction>,
}

impl InMemoryTxPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TxPool for InMemoryTxPool {
    fn select_for_block(&mut self, max_txs: usize) -> Vec<Transaction> {
        let n = max_txs.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    fn submit(&mut self, tx: Transaction) {
        self.queue.push_back(tx);
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Deterministically manufactures transactions so a simulated node always
/// has something to propose without depending on external input. Each
/// node runs its own generator seeded from the global run seed plus its
/// node id, so two nodes never synthesize identical transaction streams.
pub struct SyntheticTxGenerator {
    rng: SmallRng,
    node_id: u64,
    next_nonce: u64,
}

impl SyntheticTxGenerator {
    pub fn new(seed: u64, node_id: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed ^ node_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            node_id,
            next_nonce: 0,
        }
    }

    /// Generates a single transaction timestamped at `timestamp` (unix
    /// millis), sending a small random amount to a random peer id in
    /// `0..peer_count`.
    pub fn next(&mut self, peer_count: u64, timestamp: u64) -> Transaction {
        let recipient = if peer_count <= 1 {
            self.node_id
        } else {
            let mut candidate = self.rng.gen_range(0..peer_count);
            if candidate == self.node_id {
                candidate = (candidate + 1) % peer_count;
            }
            candidate
        };
        let amount = self.rng.gen_range(1..=100);
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        Transaction::new(self.node_id, recipient, amount, nonce, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_for_block_respects_limit_and_drains() {
        let mut pool = InMemoryTxPool::new();
        for i in 0..5 {
            pool.submit(Transaction::new(0, 1, 10, i, 1));
        }
        let batch = pool.select_for_block(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn select_for_block_never_exceeds_available() {
        let mut pool = InMemoryTxPool::new();
        pool.submit(Transaction::new(0, 1, 10, 0, 1));
        let batch = pool.select_for_block(100);
        assert_eq!(batch.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn synthetic_generator_is_deterministic_per_seed() {
        let mut a = SyntheticTxGenerator::new(42, 0);
        let mut b = SyntheticTxGenerator::new(42, 0);
        assert_eq!(a.next(4, 100), b.next(4, 100));
    }

    #[test]
    fn synthetic_generator_never_sends_to_self() {
        let mut generator = SyntheticTxGenerator::new(7, 2);
        for t in 0..50 {
            let tx = generator.next(4, t);
            assert_ne!(tx.recipient, tx.sender);
        }
    }

    #[test]
    fn synthetic_generator_increments_nonce() {
        let mut generator = SyntheticTxGenerator::new(1, 0);
        let a = generator.next(3, 1);
        let b = generator.next(3, 2);
        assert_eq!(b.nonce, a.nonce + 1);
    }
}
