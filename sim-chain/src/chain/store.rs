//! Block DAG, fork-choice, and finality tracking.
//!
//! `ChainStore` owns the block index, the children index, the pending
//! (orphan) pool, and the finalised prefix. It knows nothing about *how*
//! to validate a block or score a chain — those are supplied per call by
//! a [`ChainRules`] implementation (the consensus engine), so a third
//! consensus engine can be added without touching this module.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::chain::score::Score;
use crate::types::Block;

/// Outcome of a single [`ChainStore::insert`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Accepted,
    Orphaned,
    Duplicate,
    Invalid(String),
}

/// Observable side effects of mutating the chain store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    TipChanged {
        old: Option<String>,
        new: String,
    },
    Reorg {
        from_height: u64,
        to_height: u64,
    },
    Finalized {
        height: u64,
        hash: String,
    },
    /// Two distinct hashes were about to be recorded as finalised at the
    /// same height. This is a fatal invariant breach; the store stops
    /// advancing finality past this point and the caller is expected to
    /// log and halt the node.
    SafetyViolation {
        height: u64,
        a: String,
        b: String,
    },
}

/// Everything a [`ChainStore`] needs from a consensus engine to decide
/// whether a block is valid and how two competing tips compare.
pub trait ChainRules {
    /// Structural + consensus-specific validity check against the parent.
    fn validate(&self, block: &Block, parent: &Block) -> Result<(), String>;

    /// Comparable score for the chain ending at `tip_hash`.
    fn score(&self, store: &ChainStore, tip_hash: &str) -> Score;
}

pub struct ChainStore {
    blocks: HashMap<String, Block>,
    children: HashMap<String, HashSet<String>>,
    pending: HashMap<String, Vec<Block>>,
    /// Hashes of every block currently buffered in `pending`, so callers
    /// can tell "orphaned but already queued" apart from "truly unknown".
    pending_hashes: HashSet<String>,
    tip_set: HashSet<String>,
    current_tip: Option<String>,
    final_height: u64,
    final_hash_at_height: HashMap<u64, String>,
    finality_depth: u64,
    events: Vec<ChainEvent>,
    safety_violated: bool,
}

impl ChainStore {
    /// Creates a store seeded with `genesis` as the sole block and tip.
    pub fn new(genesis: Block, finality_depth: u64) -> Self {
        let hash = genesis.hash.clone();
        let mut blocks = HashMap::new();
        blocks.insert(hash.clone(), genesis);

        let mut final_hash_at_height = HashMap::new();
        final_hash_at_height.insert(0, hash.clone());

        let mut tip_set = HashSet::new();
        tip_set.insert(hash.clone());

        Self {
            blocks,
            children: HashMap::new(),
            pending: HashMap::new(),
            pending_hashes: HashSet::new(),
            tip_set,
            current_tip: Some(hash),
            final_height: 0,
            final_hash_at_height,
            finality_depth,
            events: Vec::new(),
            safety_violated: false,
        }
    }

    pub fn get_block(&self, hash: &str) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn current_tip(&self) -> Option<String> {
        self.current_tip.clone()
    }

    pub fn tip_set(&self) -> impl Iterator<Item = &String> {
        self.tip_set.iter()
    }

    pub fn final_height(&self) -> u64 {
        self.final_height
    }

    pub fn finalised_at(&self, height: u64) -> Option<String> {
        self.final_hash_at_height.get(&height).cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_safety_violated(&self) -> bool {
        self.safety_violated
    }

    /// Whether `hash` is buffered in the pending pool awaiting its parent.
    /// Useful to avoid re-requesting a parent that is itself already
    /// queued, e.g. in the middle of a multi-block catch-up.
    pub fn is_pending(&self, hash: &str) -> bool {
        self.pending_hashes.contains(hash)
    }

    /// Drains and returns all events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<ChainEvent> {
        std::mem::take(&mut self.events)
    }

    /// Ordered chain from genesis to `hash`, or `None` if `hash` is unknown
    /// or the chain cannot be walked back to a block with an empty parent
    /// pointer already present in the store.
    pub fn chain_to(&self, hash: &str) -> Option<Vec<Block>> {
        let mut chain = Vec::new();
        let mut cursor = hash.to_string();
        loop {
            let block = self.blocks.get(&cursor)?.clone();
            let is_genesis = block.height == 0;
            let prev = block.prev_hash.clone();
            chain.push(block);
            if is_genesis {
                break;
            }
            cursor = prev;
        }
        chain.reverse();
        Some(chain)
    }

    /// Inserts `block`, then iteratively drains any pending children of
    /// newly-accepted blocks. Returns the outcome for `block` itself; the
    /// outcomes of resolved orphans are not returned but any resulting
    /// events (tip changes, finality, reorgs) are recorded and retrievable
    /// via [`ChainStore::take_events`].
    pub fn insert(&mut self, block: Block, rules: &dyn ChainRules) -> InsertOutcome {
        let top_level_hash = block.hash.clone();
        let outcome = self.insert_one(block, rules);

        // Explicit worklist, not recursion: drain any blocks that were
        // waiting on a parent we just accepted.
        let mut worklist: VecDeque<String> = VecDeque::new();
        if outcome == InsertOutcome::Accepted {
            worklist.push_back(top_level_hash);
        }
        while let Some(parent_hash) = worklist.pop_front() {
            if let Some(waiting) = self.pending.remove(&parent_hash) {
                for child in waiting {
                    let child_hash = child.hash.clone();
                    self.pending_hashes.remove(&child_hash);
                    if self.insert_one(child, rules) == InsertOutcome::Accepted {
                        worklist.push_back(child_hash);
                    }
                }
            }
        }

        outcome
    }

    fn insert_one(&mut self, block: Block, rules: &dyn ChainRules) -> InsertOutcome {
        if !block.hash_is_valid() {
            return InsertOutcome::Invalid("hash does not match block contents".to_string());
        }
        if self.blocks.contains_key(&block.hash) || self.pending_hashes.contains(&block.hash) {
            return InsertOutcome::Duplicate;
        }
        if block.height == 0 {
            return InsertOutcome::Invalid("genesis block is not insertable".to_string());
        }

        let parent = match self.blocks.get(&block.prev_hash) {
            Some(parent) => parent.clone(),
            None => {
                self.pending_hashes.insert(block.hash.clone());
                self.pending
                    .entry(block.prev_hash.clone())
                    .or_default()
                    .push(block);
                return InsertOutcome::Orphaned;
            }
        };

        if let Err(reason) = rules.validate(&block, &parent) {
            return InsertOutcome::Invalid(reason);
        }

        let hash = block.hash.clone();
        let prev_hash = block.prev_hash.clone();

        self.blocks.insert(hash.clone(), block);
        self.children
            .entry(prev_hash.clone())
            .or_default()
            .insert(hash.clone());
        self.tip_set.remove(&prev_hash);
        self.tip_set.insert(hash.clone());

        self.update_tip(rules);

        InsertOutcome::Accepted
    }

    fn update_tip(&mut self, rules: &dyn ChainRules) {
        let best = self
            .tip_set
            .iter()
            .cloned()
            .map(|hash| {
                let score = rules.score(self, &hash);
                (score, hash)
            })
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, hash)| hash);

        let Some(best_hash) = best else { return };

        if self.current_tip.as_deref() == Some(best_hash.as_str()) {
            return;
        }

        let old_tip = self.current_tip.clone();
        if let Some(old) = &old_tip {
            self.record_reorg(old, &best_hash);
        }

        self.current_tip = Some(best_hash.clone());
        self.events.push(ChainEvent::TipChanged {
            old: old_tip,
            new: best_hash.clone(),
        });

        self.update_finality(&best_hash);
    }

    /// Walks both chains back to their lowest common ancestor and records
    /// the reorganised height range. No stored blocks are mutated; this is
    /// purely observational.
    fn record_reorg(&mut self, old_tip: &str, new_tip: &str) {
        let Some(old_chain) = self.chain_to(old_tip) else {
            return;
        };
        let Some(new_chain) = self.chain_to(new_tip) else {
            return;
        };

        let old_hashes: HashSet<&str> = old_chain.iter().map(|b| b.hash.as_str()).collect();
        let lca_height = new_chain
            .iter()
            .rev()
            .find(|b| old_hashes.contains(b.hash.as_str()))
            .map(|b| b.height);

        if let Some(lca_height) = lca_height {
            let old_tip_height = old_chain.last().map(|b| b.height).unwrap_or(0);
            let new_tip_height = new_chain.last().map(|b| b.height).unwrap_or(0);
            let to_height = old_tip_height.max(new_tip_height);
            if to_height > lca_height {
                self.events.push(ChainEvent::Reorg {
                    from_height: lca_height,
                    to_height,
                });
            }
        }
    }

    /// Walks back from `tip_hash`; every block at depth >= `finality_depth`
    /// is recorded as finalised at its height, unless a conflicting hash is
    /// already recorded there, in which case a `SafetyViolation` is raised
    /// and no further finality progress is made.
    fn update_finality(&mut self, tip_hash: &str) {
        if self.safety_violated {
            return;
        }
        let Some(chain) = self.chain_to(tip_hash) else {
            return;
        };
        let tip_index = chain.len().saturating_sub(1);
        if (tip_index as u64) < self.finality_depth {
            return;
        }
        let newly_finalisable_up_to = tip_index as u64 - self.finality_depth;

        let mut new_max_height = self.final_height;
        for block in chain.iter().take(newly_finalisable_up_to as usize + 1) {
            let height = block.height;
            match self.final_hash_at_height.get(&height) {
                Some(existing) if existing == &block.hash => {}
                Some(existing) => {
                    self.events.push(ChainEvent::SafetyViolation {
                        height,
                        a: existing.clone(),
                        b: block.hash.clone(),
                    });
                    self.safety_violated = true;
                    return;
                }
                None => {
                    self.final_hash_at_height.insert(height, block.hash.clone());
                    self.events.push(ChainEvent::Finalized {
                        height,
                        hash: block.hash.clone(),
                    });
                    new_max_height = new_max_height.max(height);
                }
            }
        }
        self.final_height = self.final_height.max(new_max_height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transaction;

    struct LongestChainRules;

    impl ChainRules for LongestChainRules {
        fn validate(&self, block: &Block, parent: &Block) -> Result<(), String> {
            if block.height != parent.height + 1 {
                return Err("height mismatch".to_string());
            }
            Ok(())
        }

        fn score(&self, store: &ChainStore, tip_hash: &str) -> Score {
            let height = store.get_block(tip_hash).map(|b| b.height).unwrap_or(0);
            Score::new(height as u128, 0, tip_hash)
        }
    }

    fn child_of(parent: &Block, proposer_id: u64, timestamp: u64, nonce: u64) -> Block {
        let mut block = Block {
            height: parent.height + 1,
            prev_hash: parent.hash.clone(),
            transactions: vec![Transaction::new(1, 2, 10, 0, timestamp)],
            proposer_id,
            timestamp,
            nonce,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    #[test]
    fn insert_genesis_child_updates_tip() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone(), 4);
        let b1 = child_of(&genesis, 0, 1, 0);

        let outcome = store.insert(b1.clone(), &LongestChainRules);
        assert_eq!(outcome, InsertOutcome::Accepted);
        assert_eq!(store.current_tip(), Some(b1.hash.clone()));

        let events = store.take_events();
        assert!(events.contains(&ChainEvent::TipChanged {
            old: Some(genesis.hash.clone()),
            new: b1.hash.clone(),
        }));
    }

    #[test]
    fn orphan_is_buffered_and_flushed_on_parent_arrival() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone(), 4);
        let b1 = child_of(&genesis, 0, 1, 0);
        let b2 = child_of(&b1, 0, 2, 0);

        // b2 arrives first: orphaned.
        let outcome = store.insert(b2.clone(), &LongestChainRules);
        assert_eq!(outcome, InsertOutcome::Orphaned);
        assert_eq!(store.current_tip(), Some(genesis.hash.clone()));

        // b1 arrives: both b1 and the pending b2 should be accepted.
        let outcome = store.insert(b1.clone(), &LongestChainRules);
        assert_eq!(outcome, InsertOutcome::Accepted);
        assert_eq!(store.current_tip(), Some(b2.hash.clone()));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn orphan_resubmitted_before_parent_is_a_duplicate() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone(), 4);
        let b1 = child_of(&genesis, 0, 1, 0);
        let b2 = child_of(&b1, 0, 2, 0);

        assert_eq!(
            store.insert(b2.clone(), &LongestChainRules),
            InsertOutcome::Orphaned
        );
        assert!(store.is_pending(&b2.hash));
        assert_eq!(
            store.insert(b2.clone(), &LongestChainRules),
            InsertOutcome::Duplicate
        );

        store.insert(b1, &LongestChainRules);
        assert!(!store.is_pending(&b2.hash));
        assert_eq!(store.current_tip(), Some(b2.hash));
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone(), 4);
        let b1 = child_of(&genesis, 0, 1, 0);

        assert_eq!(
            store.insert(b1.clone(), &LongestChainRules),
            InsertOutcome::Accepted
        );
        assert_eq!(
            store.insert(b1.clone(), &LongestChainRules),
            InsertOutcome::Duplicate
        );
    }

    #[test]
    fn tampered_hash_is_invalid() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone(), 4);
        let mut b1 = child_of(&genesis, 0, 1, 0);
        b1.height = 99; // invalidates hash without recomputing it

        match store.insert(b1, &LongestChainRules) {
            InsertOutcome::Invalid(_) => {}
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn finality_advances_at_depth_k() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone(), 2);
        let mut parent = genesis.clone();
        for i in 0..5u64 {
            let block = child_of(&parent, 0, i + 1, 0);
            assert_eq!(
                store.insert(block.clone(), &LongestChainRules),
                InsertOutcome::Accepted
            );
            parent = block;
        }
        // Tip height is 5, finality depth 2 => heights 0..=3 finalised.
        assert_eq!(store.final_height(), 3);
        assert!(store.finalised_at(3).is_some());
        assert!(store.finalised_at(4).is_none());
    }

    #[test]
    fn fork_choice_prefers_longer_chain_and_reorgs() {
        let genesis = Block::genesis();
        let mut store = ChainStore::new(genesis.clone(), 100);

        let a1 = child_of(&genesis, 0, 1, 0);
        store.insert(a1.clone(), &LongestChainRules);

        // Competing branch at height 1.
        let b1 = child_of(&genesis, 1, 2, 1);
        store.insert(b1.clone(), &LongestChainRules);

        // Tip should remain on whichever height-1 block compares greatest;
        // both have equal score components except hash, so the smaller
        // hash wins deterministically.
        let expected = if a1.hash < b1.hash { &a1 } else { &b1 };
        assert_eq!(store.current_tip(), Some(expected.hash.clone()));

        // Extend the other branch past the current tip: a reorg occurs.
        let other = if a1.hash < b1.hash { &b1 } else { &a1 };
        let other2 = child_of(other, 0, 3, 0);
        store.insert(other2.clone(), &LongestChainRules);

        assert_eq!(store.current_tip(), Some(other2.hash));
        let events = store.take_events();
        assert!(events.iter().any(|e| matches!(e, ChainEvent::Reorg { .. })));
    }
}
