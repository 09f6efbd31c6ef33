//! Core domain types: transactions and blocks.

pub mod block;
pub mod tx;

pub use block::{genesis_prev_hash, Block};
pub use tx::Transaction;
