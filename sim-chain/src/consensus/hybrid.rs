//! Hybrid stake-weighted leader election with a light proof-of-work tie-in.
//!
//! The leader for height `h` is chosen deterministically from
//! `sha256(parent_hash || h) mod total_stake`, walking the stake table in
//! node-id order until the drawn value falls inside a node's cumulative
//! stake range. The elected leader still has to find a nonce satisfying a
//! much lower difficulty than [`crate::config::PowConfig`] would require,
//! so an elected-but-offline leader cannot stall the chain indefinitely: if
//! `leader_timeout_ms` passes without a block for the slot, any node may
//! step in as a fallback proposer.

use std::time::Duration;

use crate::chain::{ChainRules, ChainStore, Score};
use crate::config::HybridConfig;
use crate::consensus::engine::{CancelToken, ConsensusEngine, ProduceOutcome, MAX_BLOCK_TXS};
use crate::hash::{meets_difficulty, sha256_hex};
use crate::types::{Block, Transaction};

const MAX_NONCE_ATTEMPTS: u64 = 1_000_000;

pub struct HybridEngine {
    config: HybridConfig,
}

impl HybridEngine {
    pub fn new(config: HybridConfig) -> Self {
        Self { config }
    }

    /// Node id elected to propose at `height` given `parent_hash`, or
    /// `None` if no stake is configured.
    pub fn leader_for(&self, parent_hash: &str, height: u64) -> Option<u64> {
        let total = self.config.total_stake();
        if total == 0 {
            return None;
        }
        let digest = sha256_hex(format!("{parent_hash}:{height}").as_bytes());
        let draw = u64::from_str_radix(&digest[..16], 16).unwrap_or(0) % total;

        let mut cumulative = 0u64;
        for node_id in 0..self.config.stakes.len() as u64 {
            cumulative += self.config.stake_of(node_id);
            if draw < cumulative {
                return Some(node_id);
            }
        }
        None
    }

    /// Whether `timestamp` is late enough past `parent_timestamp` that any
    /// node (not just the elected leader) may propose the slot.
    fn fallback_window_open(&self, parent_timestamp: u64, timestamp: u64) -> bool {
        timestamp.saturating_sub(parent_timestamp) >= self.config.leader_timeout_ms
    }
}

impl ChainRules for HybridEngine {
    fn validate(&self, block: &Block, parent: &Block) -> Result<(), String> {
        if block.height != parent.height + 1 {
            return Err(format!(
                "expected height {}, got {}",
                parent.height + 1,
                block.height
            ));
        }
        if block.transactions.len() > MAX_BLOCK_TXS {
            return Err(format!(
                "block carries {} transactions, limit is {MAX_BLOCK_TXS}",
                block.transactions.len()
            ));
        }
        if !block.hash_is_valid() {
            return Err("block hash does not match contents".to_string());
        }
        if block.timestamp < parent.timestamp {
            return Err(format!(
                "timestamp {} precedes parent timestamp {}",
                block.timestamp, parent.timestamp
            ));
        }
        let is_fallback = self.fallback_window_open(parent.timestamp, block.timestamp);
        match self.leader_for(&parent.hash, block.height) {
            Some(leader) if leader == block.proposer_id => {}
            Some(_) if is_fallback => {}
            Some(leader) => {
                return Err(format!(
                    "block proposed by {} but slot leader is {leader} and leader_timeout_ms has not elapsed",
                    block.proposer_id
                ))
            }
            None => return Err("no stake configured, no valid leader".to_string()),
        }
        if !meets_difficulty(&block.hash, self.config.light_difficulty) {
            return Err(format!(
                "hash {} does not meet light PoW difficulty {}",
                block.hash, self.config.light_difficulty
            ));
        }
        Ok(())
    }

    fn score(&self, store: &ChainStore, tip_hash: &str) -> Score {
        let Some(chain) = store.chain_to(tip_hash) else {
            return Score::new(0, 0, tip_hash);
        };
        let height = chain.last().map(|b| b.height).unwrap_or(0);
        let stake_work: u64 = chain
            .iter()
            .skip(1) // genesis has no elected proposer
            .map(|b| self.config.stake_of(b.proposer_id))
            .sum();
        Score::new(stake_work as u128, height, tip_hash)
    }
}

impl ConsensusEngine for HybridEngine {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn as_chain_rules(&self) -> &dyn ChainRules {
        self
    }

    /// Leadership (or an expired leader timeout) is necessary but not
    /// sufficient: proposals are also paced to the configured block
    /// interval, since the light PoW is too cheap to throttle anything.
    fn can_propose(&self, parent: &Block, now_ms: u64, node_id: u64) -> bool {
        if now_ms < parent.timestamp + self.config.block_time_ms {
            return false;
        }
        self.leader_for(&parent.hash, parent.height + 1) == Some(node_id)
            || self.fallback_window_open(parent.timestamp, now_ms)
    }

    fn block_interval(&self) -> Duration {
        Duration::from_millis(self.config.block_time_ms)
    }

    fn produce(
        &self,
        parent: &Block,
        transactions: Vec<Transaction>,
        proposer_id: u64,
        timestamp: u64,
        cancel: &CancelToken,
    ) -> ProduceOutcome {
        let height = parent.height + 1;
        let is_leader = self.leader_for(&parent.hash, height) == Some(proposer_id);
        let is_fallback = self.fallback_window_open(parent.timestamp, timestamp);
        if !is_leader && !is_fallback {
            return ProduceOutcome::NotEligible;
        }

        let mut block = Block {
            height,
            prev_hash: parent.hash.clone(),
            transactions,
            proposer_id,
            timestamp,
            nonce: 0,
            hash: String::new(),
        };

        for attempt in 0..MAX_NONCE_ATTEMPTS {
            if cancel.is_cancelled() {
                return ProduceOutcome::Cancelled;
            }
            block.nonce = attempt;
            let hash = block.compute_hash();
            if meets_difficulty(&hash, self.config.light_difficulty) {
                block.hash = hash;
                return ProduceOutcome::Produced(block);
            }
        }
        ProduceOutcome::Cancelled
    }
}
