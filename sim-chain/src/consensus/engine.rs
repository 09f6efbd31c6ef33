//! The consensus engine trait and cooperative mining cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainRules;
use crate::types::{Block, Transaction};

/// Upper bound on transactions per block, applied both when pulling a
/// batch from the pool for production and when validating a peer's block,
/// so a gossiped block can never be arbitrarily large.
pub const MAX_BLOCK_TXS: usize = 100;

/// Shared flag used to interrupt an in-progress `produce` call, e.g. when a
/// competing block for the same height arrives over the network while this
/// node is still mining. One token is armed per production round; firing it
/// is the only way a caller aborts mining.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a [`ConsensusEngine::produce`] attempt.
pub enum ProduceOutcome {
    /// A block was produced and is ready to be inserted and broadcast.
    Produced(Block),
    /// Production was interrupted via [`CancelToken::cancel`] before a
    /// valid block was found.
    Cancelled,
    /// This node is not currently eligible to produce (e.g. not the slot
    /// leader under Hybrid consensus).
    NotEligible,
}

/// A pluggable consensus scheme.
///
/// Implementors supply both sides of consensus: producing new blocks when
/// eligible, and validating/scoring blocks received from peers. The same
/// trait doubles as a [`ChainRules`] supertrait so any engine can be
/// plugged directly into a [`crate::chain::ChainStore`] unmodified.
pub trait ConsensusEngine: ChainRules + Send + Sync {
    /// Human-readable name, used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Whether this node may attempt to produce a successor to `parent` at
    /// wall-clock `now_ms`. Always true for PoW; gated on slot leadership
    /// (or the leader-timeout fallback window) for Hybrid.
    fn can_propose(&self, parent: &Block, now_ms: u64, node_id: u64) -> bool;

    /// Attempts to produce the next block on top of `parent`, carrying
    /// `transactions`. CPU-bound for PoW mining; callers run it on a
    /// blocking worker and interrupt it through `cancel`.
    fn produce(
        &self,
        parent: &Block,
        transactions: Vec<Transaction>,
        proposer_id: u64,
        timestamp: u64,
        cancel: &CancelToken,
    ) -> ProduceOutcome;

    /// Maximum number of transactions to pull from the pool per block.
    /// Validation enforces the same bound on incoming blocks.
    fn max_block_txs(&self) -> usize {
        MAX_BLOCK_TXS
    }

    /// Target spacing between consecutive locally produced blocks.
    fn block_interval(&self) -> Duration;

    /// Narrows `self` to the [`ChainRules`] half of this engine. A plain
    /// `&dyn ConsensusEngine` cannot be passed where `&dyn ChainRules` is
    /// expected (they are different trait objects even though
    /// `ConsensusEngine` requires `ChainRules`), so `ChainStore::insert`
    /// goes through this instead. Each engine implements this as `{ self }`;
    /// it cannot be a default method body because that would need to
    /// type-check against an abstract, possibly-unsized `Self`.
    fn as_chain_rules(&self) -> &dyn ChainRules;
}
