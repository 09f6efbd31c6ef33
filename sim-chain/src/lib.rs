//! Core library for a peer-to-peer blockchain consensus simulator.
//!
//! A node gossips blocks over TCP, runs one of two pluggable consensus
//! engines ([`consensus::PowEngine`] or [`consensus::HybridEngine`]), and
//! can be run under an injected network scenario ([`scenario`]) to study
//! fork-choice, reorgs, and finality under delay or partition.

pub mod chain;
pub mod config;
pub mod consensus;
pub mod error;
pub mod hash;
pub mod invariants;
pub mod logging;
pub mod mempool;
pub mod metrics;
pub mod net;
pub mod scenario;
pub mod scheduler;
pub mod time;
pub mod types;

pub use chain::{ChainEvent, ChainRules, ChainStore, InsertOutcome, Score};
pub use consensus::{CancelToken, ConsensusEngine, HybridEngine, PowEngine, ProduceOutcome};
pub use error::{ConfigError, NetError, NodeError};
pub use scheduler::{NodeScheduler, RunOutcome};
pub use types::{Block, Transaction};
