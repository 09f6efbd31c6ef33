//! Proof-of-Work consensus: longest valid chain, nonce search by leading
//! hex zero nibbles.

use std::time::Duration;

use crate::chain::{ChainRules, ChainStore, Score};
use crate::config::PowConfig;
use crate::consensus::engine::{CancelToken, ConsensusEngine, ProduceOutcome, MAX_BLOCK_TXS};
use crate::hash::meets_difficulty;
use crate::types::{Block, Transaction};

/// How many nonces to try between checks of the cancellation flag.
const CANCEL_CHECK_STRIDE: u64 = 2048;

pub struct PowEngine {
    config: PowConfig,
}

impl PowEngine {
    pub fn new(config: PowConfig) -> Self {
        Self { config }
    }
}

impl ChainRules for PowEngine {
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
        if !meets_difficulty(&block.hash, self.config.difficulty) {
            return Err(format!(
                "hash {} does not meet difficulty {}",
                block.hash, self.config.difficulty
            ));
        }
        Ok(())
    }

    fn score(&self, store: &ChainStore, tip_hash: &str) -> Score {
        let height = store.get_block(tip_hash).map(|b| b.height).unwrap_or(0);
        Score::new(height as u128, 0, tip_hash)
    }
}

impl ConsensusEngine for PowEngine {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn as_chain_rules(&self) -> &dyn ChainRules {
        self
    }

    /// Any miner may work on any tip at any time.
    fn can_propose(&self, _parent: &Block, _now_ms: u64, _node_id: u64) -> bool {
        true
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
        let mut block = Block {
            height: parent.height + 1,
            prev_hash: parent.hash.clone(),
            transactions,
            proposer_id,
            timestamp,
            nonce: 0,
            hash: String::new(),
        };

        for attempt in 0..self.config.max_nonce_attempts {
            if attempt % CANCEL_CHECK_STRIDE == 0 && cancel.is_cancelled() {
                return ProduceOutcome::Cancelled;
            }
            block.nonce = attempt;
            let hash = block.compute_hash();
            if meets_difficulty(&hash, self.config.difficulty) {
                block.hash = hash;
                return ProduceOutcome::Produced(block);
            }
        }
        ProduceOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transaction;

    fn mined_child(parent: &Block, difficulty: u32, proposer_id: u64) -> Block {
        let engine = PowEngine::new(PowConfig {
            difficulty,
            max_nonce_attempts: 1_000_000,
            ..Default::default()
        });
        let cancel = CancelToken::new();
        match engine.produce(parent, Vec::new(), proposer_id, 1, &cancel) {
            ProduceOutcome::Produced(block) => block,
            _ => panic!("mining should succeed at low difficulty"),
        }
    }

    #[test]
    fn produced_block_meets_difficulty_and_validates() {
        let genesis = Block::genesis();
        let block = mined_child(&genesis, 1, 0);
        let engine = PowEngine::new(PowConfig {
            difficulty: 1,
            ..Default::default()
        });
        assert!(meets_difficulty(&block.hash, 1));
        assert!(engine.validate(&block, &genesis).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_height() {
        let genesis = Block::genesis();
        let mut block = mined_child(&genesis, 1, 0);
        block.height = 5;
        block.hash = block.compute_hash();
        let engine = PowEngine::new(PowConfig {
            difficulty: 1,
            ..Default::default()
        });
        assert!(engine.validate(&block, &genesis).is_err());
    }

    #[test]
    fn validate_rejects_insufficient_difficulty() {
        let genesis = Block::genesis();
        let mut block = Block {
            height: 1,
            prev_hash: genesis.hash.clone(),
            transactions: vec![Transaction::new(0, 1, 1, 0, 1)],
            proposer_id: 0,
            timestamp: 1,
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        let engine = PowEngine::new(PowConfig {
            difficulty: 64,
            ..Default::default()
        });
        assert!(engine.validate(&block, &genesis).is_err());
    }

    #[test]
    fn validate_rejects_overfull_block() {
        let genesis = Block::genesis();
        let transactions: Vec<Transaction> = (0..=MAX_BLOCK_TXS as u64)
            .map(|nonce| Transaction::new(0, 1, 1, nonce, 1))
            .collect();
        let mut block = Block {
            height: 1,
            prev_hash: genesis.hash.clone(),
            transactions,
            proposer_id: 0,
            timestamp: 1,
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        // Difficulty 0 so the only failing check is the transaction bound.
        let engine = PowEngine::new(PowConfig {
            difficulty: 0,
            ..Default::default()
        });
        let err = engine.validate(&block, &genesis).unwrap_err();
        assert!(err.contains("transactions"), "unexpected reason: {err}");
    }

    #[test]
    fn cancel_token_stops_mining() {
        let genesis = Block::genesis();
        let engine = PowEngine::new(PowConfig {
            difficulty: 64, // unreachable within the attempt budget
            max_nonce_attempts: 10_000,
            ..Default::default()
        });
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = engine.produce(&genesis, Vec::new(), 0, 1, &cancel);
        assert!(matches!(outcome, ProduceOutcome::Cancelled));
    }

    #[test]
    fn pow_can_always_propose() {
        let engine = PowEngine::new(PowConfig::default());
        let genesis = Block::genesis();
        assert!(engine.can_propose(&genesis, 0, 0));
        assert!(engine.can_propose(&genesis, u64::MAX, 4));
    }
}
