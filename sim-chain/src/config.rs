//! JSON-backed consensus configuration.
//!
//! Unlike a node's identity (`--node-id`) and run parameters (`--seed`,
//! `--scenario`), consensus parameters are shared by every node in a run
//! and loaded from one of two fixed files under `--config-dir`:
//! `pow_config.json` or `hybrid_config.json`, whichever matches
//! `--consensus`. The node count for a run is implicit in the length of
//! `initial_balances` (PoW) or `stakes` (Hybrid): every node is
//! addressed at `127.0.0.1:9000 + node_id`, so the peer set is just every
//! other index in that range.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_finality_depth() -> u64 {
    4
}

/// Proof-of-Work tuning parameters, loaded from `pow_config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowConfig {
    /// Number of leading hex zero nibbles a block hash must have.
    pub difficulty: u32,
    pub block_time_ms: u64,
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
    /// Starting balance per account id. Consensus treats transactions as
    /// opaque payloads and never reads this; it exists purely for the
    /// offline invariant checks and synthetic traffic generation in
    /// `sim_chain::invariants` / `sim_chain::mempool` to draw on.
    #[serde(default)]
    pub initial_balances: Vec<u64>,
    /// Mining attempt budget per call to `produce`, after which it backs
    /// off rather than spin forever against an unreachable difficulty.
    #[serde(default = "default_max_nonce_attempts")]
    pub max_nonce_attempts: u64,
}

fn default_max_nonce_attempts() -> u64 {
    5_000_000
}

impl PowConfig {
    pub fn node_count(&self) -> usize {
        self.initial_balances.len().max(1)
    }

    /// Rejects parameter combinations a node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty as usize > 64 {
            return Err(ConfigError::InvalidValue(format!(
                "difficulty {} exceeds the 64 hex digits of a SHA-256 hash",
                self.difficulty
            )));
        }
        if self.block_time_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "block_time_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hybrid stake-weighted + light-PoW tuning parameters, loaded from
/// `hybrid_config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HybridConfig {
    /// Leading hex zero nibbles the slot leader's light PoW must satisfy.
    pub light_difficulty: u32,
    pub block_time_ms: u64,
    /// Stake weight indexed by node id; `stakes[i]` is node `i`'s stake.
    pub stakes: Vec<u64>,
    /// If no valid block for a slot arrives within this many milliseconds
    /// of its parent's timestamp, any node may propose it instead of only
    /// the elected leader.
    pub leader_timeout_ms: u64,
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
}

impl HybridConfig {
    pub fn node_count(&self) -> usize {
        self.stakes.len().max(1)
    }

    pub fn total_stake(&self) -> u64 {
        self.stakes.iter().sum()
    }

    pub fn stake_of(&self, node_id: u64) -> u64 {
        self.stakes.get(node_id as usize).copied().unwrap_or(0)
    }

    /// Rejects parameter combinations a node cannot run with; in
    /// particular, leader election is undefined without any stake.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stakes.is_empty() {
            return Err(ConfigError::InvalidValue(
                "stakes must not be empty".to_string(),
            ));
        }
        if self.total_stake() == 0 {
            return Err(ConfigError::InvalidValue(
                "total stake must be positive".to_string(),
            ));
        }
        if self.light_difficulty as usize > 64 {
            return Err(ConfigError::InvalidValue(format!(
                "light_difficulty {} exceeds the 64 hex digits of a SHA-256 hash",
                self.light_difficulty
            )));
        }
        if self.block_time_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "block_time_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            difficulty: 2,
            block_time_ms: 1000,
            finality_depth: default_finality_depth(),
            initial_balances: Vec::new(),
            max_nonce_attempts: default_max_nonce_attempts(),
        }
    }
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            light_difficulty: 1,
            block_time_ms: 1000,
            stakes: Vec::new(),
            leader_timeout_ms: 1000,
            finality_depth: default_finality_depth(),
        }
    }
}

/// Which consensus scheme a node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusKind {
    Pow,
    Hybrid,
}

/// Fixed two-group network partition, loaded from `partition_config.json`
/// when `--scenario partition` is selected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub group_a: Vec<u64>,
    pub group_b: Vec<u64>,
    pub heal_at_ms: u64,
}

impl Default for PartitionConfig {
    /// Default split for a 5-node run: `{0, 1}` against `{2, 3, 4}`,
    /// healing 15 seconds in.
    fn default() -> Self {
        Self {
            group_a: vec![0, 1],
            group_b: vec![2, 3, 4],
            heal_at_ms: 15_000,
        }
    }
}

fn config_path(config_dir: &str, file_name: &str) -> String {
    format!("{config_dir}/{file_name}")
}

/// Loads, parses, and validates `pow_config.json` from `config_dir`.
pub fn load_pow_config(config_dir: &str) -> Result<PowConfig, ConfigError> {
    let config: PowConfig = load_json(&config_path(config_dir, "pow_config.json"))?;
    config.validate()?;
    Ok(config)
}

/// Loads, parses, and validates `hybrid_config.json` from `config_dir`.
pub fn load_hybrid_config(config_dir: &str) -> Result<HybridConfig, ConfigError> {
    let config: HybridConfig = load_json(&config_path(config_dir, "hybrid_config.json"))?;
    config.validate()?;
    Ok(config)
}

/// Loads `partition_config.json` from `config_dir`, falling back to the
/// default split if the file is absent.
pub fn load_partition_config(config_dir: &str) -> Result<PartitionConfig, ConfigError> {
    let path = config_path(config_dir, "partition_config.json");
    if !Path::new(&path).exists() {
        return Ok(PartitionConfig::default());
    }
    load_json(&path)
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &str) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|_| ConfigError::MissingFile(path.to_string()))?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

/// `127.0.0.1:9000 + node_id`, the fixed address scheme every node binds
/// to and every peer dials.
pub fn node_addr(node_id: u64) -> String {
    format!("127.0.0.1:{}", 9000 + node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_errors() {
        let err = load_pow_config("/nonexistent/config/dir").unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn load_parses_pow_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pow_config.json"),
            r#"{
                "difficulty": 3,
                "block_time_ms": 500,
                "finality_depth": 4,
                "initial_balances": [100, 100, 100]
            }"#,
        )
        .unwrap();

        let cfg = load_pow_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.difficulty, 3);
        assert_eq!(cfg.finality_depth, 4);
        assert_eq!(cfg.node_count(), 3);
    }

    #[test]
    fn load_parses_hybrid_config_and_derives_node_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hybrid_config.json"),
            r#"{
                "light_difficulty": 2,
                "block_time_ms": 1000,
                "stakes": [200, 300, 150, 250, 100],
                "leader_timeout_ms": 1000
            }"#,
        )
        .unwrap();

        let cfg = load_hybrid_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.node_count(), 5);
        assert_eq!(cfg.total_stake(), 1000);
        assert_eq!(cfg.stake_of(1), 300);
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pow_config.json"), "{ not json").unwrap();
        let err = load_pow_config(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_partition_config_falls_back_to_default_split() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_partition_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.group_a, vec![0, 1]);
        assert_eq!(cfg.group_b, vec![2, 3, 4]);
    }

    #[test]
    fn zero_total_stake_refuses_to_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hybrid_config.json"),
            r#"{
                "light_difficulty": 2,
                "block_time_ms": 1000,
                "stakes": [0, 0, 0],
                "leader_timeout_ms": 1000
            }"#,
        )
        .unwrap();
        let err = load_hybrid_config(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn node_addr_follows_fixed_scheme() {
        assert_eq!(node_addr(0), "127.0.0.1:9000");
        assert_eq!(node_addr(3), "127.0.0.1:9003");
    }
}
