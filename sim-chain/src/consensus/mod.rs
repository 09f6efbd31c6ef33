//! Pluggable consensus engines.
//!
//! An engine decides whether a local node may currently produce a block,
//! how to produce one, and how to validate and score blocks produced by
//! others. `chain::ChainStore` is generic over any [`ChainRules`]
//! implementation; both engines here implement it so the store never has
//! to know which consensus scheme is in effect.

pub mod engine;
pub mod hybrid;
pub mod pow;

pub use engine::{CancelToken, ConsensusEngine, ProduceOutcome, MAX_BLOCK_TXS};
pub use hybrid::HybridEngine;
pub use pow::PowEngine;
