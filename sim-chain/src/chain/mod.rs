//! Block DAG storage, fork-choice and finality.

pub mod score;
pub mod store;

pub use score::Score;
pub use store::{ChainEvent, ChainRules, ChainStore, InsertOutcome};
