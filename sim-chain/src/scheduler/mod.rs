//! Wires the chain store, consensus engine, transport, and mempool into a
//! running node: a handful of cooperating `tokio` tasks sharing state
//! behind `tokio::sync::Mutex` and a `watch` channel for tip-change
//! notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::chain::{ChainEvent, ChainStore, InsertOutcome};
use crate::consensus::{CancelToken, ConsensusEngine, ProduceOutcome};
use crate::logging::events;
use crate::mempool::{SyntheticTxGenerator, TxPool};
use crate::metrics::MetricsRegistry;
use crate::net::message::ScoreSummary;
use crate::net::{Message, Transport};
use crate::time::now_ms;
use crate::types::Block;

/// Default wall-clock run budget: the whole simulation exits after this
/// much time.
pub const DEFAULT_RUN_BUDGET: Duration = Duration::from_secs(30);

/// Most blocks sent back for a single `GetBlock`; a peer further behind
/// than this walks back in strides, orphaning the oldest block of each
/// response and requesting its parent.
const CATCHUP_WINDOW: usize = 64;

/// Why [`NodeScheduler::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run budget elapsed; this is the expected, successful exit.
    RunBudgetExpired,
    /// The chain store detected two different finalised hashes at the
    /// same height. Fatal: the caller should exit non-zero.
    SafetyViolation,
}

/// Shared, mutable state a running node's tasks all touch.
struct Shared {
    node_id: u64,
    store: AsyncMutex<ChainStore>,
    pool: AsyncMutex<Box<dyn TxPool>>,
    engine: Box<dyn ConsensusEngine>,
    transport: Arc<Transport>,
    metrics: Arc<MetricsRegistry>,
    tip_tx: watch::Sender<Option<String>>,
    /// Cancellation token armed for the production round currently in
    /// flight. The inbound task fires it on tip change; production arms a
    /// fresh one each round.
    active_cancel: std::sync::Mutex<CancelToken>,
    peer_count: u64,
    seed: u64,
    started_at: Instant,
    run_budget: Duration,
    halted: AtomicBool,
}

impl Shared {
    fn deadline_passed(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.started_at.elapsed() >= self.run_budget
    }

    fn cancel_active_production(&self) {
        self.active_cancel.lock().unwrap().cancel();
    }
}

/// Orchestrates one simulated node end to end.
pub struct NodeScheduler {
    shared: Arc<Shared>,
}

impl NodeScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: u64,
        seed: u64,
        peer_count: u64,
        finality_depth: u64,
        genesis: Block,
        engine: Box<dyn ConsensusEngine>,
        transport: Arc<Transport>,
        metrics: Arc<MetricsRegistry>,
        run_budget: Duration,
    ) -> Self {
        let store = ChainStore::new(genesis, finality_depth);
        let (tip_tx, _tip_rx) = watch::channel(store.current_tip());
        let pool: Box<dyn TxPool> = Box::new(crate::mempool::InMemoryTxPool::new());

        let shared = Arc::new(Shared {
            node_id,
            store: AsyncMutex::new(store),
            pool: AsyncMutex::new(pool),
            engine,
            transport,
            metrics,
            tip_tx,
            active_cancel: std::sync::Mutex::new(CancelToken::new()),
            peer_count,
            seed,
            started_at: Instant::now(),
            run_budget,
            halted: AtomicBool::new(false),
        });

        Self { shared }
    }

    pub fn tip_watch(&self) -> watch::Receiver<Option<String>> {
        self.shared.tip_tx.subscribe()
    }

    /// Runs `f` against the locked chain store, for post-run inspection
    /// (tests, offline invariant checks over the finalised chain).
    pub async fn with_store<R>(&self, f: impl FnOnce(&ChainStore) -> R) -> R {
        let store = self.shared.store.lock().await;
        f(&store)
    }

    /// Runs the node until the run budget elapses or a safety violation
    /// halts it. Spawns the production, inbound-gossip, synthetic
    /// transaction, and metrics-refresh tasks plus a deadline watchdog,
    /// then waits on all of them. Network scenario filtering
    /// (delay/partition) is installed on the transport directly via
    /// [`Transport::set_scenario`], not here.
    pub async fn run(
        &self,
        mut inbound_rx: tokio::sync::mpsc::UnboundedReceiver<(u64, Message)>,
    ) -> RunOutcome {
        let node_id = self.shared.node_id;
        let seed = self.shared.seed;
        let peer_count = self.shared.peer_count;

        // Advertise genesis (or whatever the store starts at) before any
        // handshake fires.
        update_local_tip(&self.shared).await;

        let production = tokio::spawn(run_production_loop(Arc::clone(&self.shared)));
        let inbound = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                // Bounded waits so the task still observes the deadline on
                // a quiet network (a lone node never receives anything).
                loop {
                    if shared.deadline_passed() {
                        break;
                    }
                    match tokio::time::timeout(Duration::from_millis(200), inbound_rx.recv()).await
                    {
                        Err(_elapsed) => continue,
                        Ok(None) => break,
                        Ok(Some((from_peer, msg))) => handle_inbound(&shared, from_peer, msg).await,
                    }
                }
            })
        };
        let tx_generation = tokio::spawn(run_tx_generation_loop(
            Arc::clone(&self.shared),
            seed,
            node_id,
            peer_count.max(1),
        ));
        let metrics_refresh = tokio::spawn(run_metrics_loop(Arc::clone(&self.shared)));
        // Unblocks an in-flight mining call promptly once the budget is
        // spent (or a safety violation halts the node).
        let watchdog = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                while !shared.deadline_passed() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                shared.cancel_active_production();
            })
        };

        let _ = tokio::join!(production, inbound, tx_generation, metrics_refresh, watchdog);

        if self.shared.halted.load(Ordering::SeqCst) {
            RunOutcome::SafetyViolation
        } else {
            RunOutcome::RunBudgetExpired
        }
    }

    /// Stops the node early: marks it halted and interrupts any in-flight
    /// production.
    pub fn shutdown(&self) {
        self.shared.halted.store(true, Ordering::SeqCst);
        self.shared.cancel_active_production();
    }
}

async fn run_production_loop(shared: Arc<Shared>) {
    let mut tip_rx = shared.tip_tx.subscribe();
    loop {
        if shared.deadline_passed() {
            return;
        }

        let parent = {
            let store = shared.store.lock().await;
            store
                .current_tip()
                .and_then(|tip| store.get_block(&tip).cloned())
        };
        let Some(parent) = parent else {
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        };

        let timestamp = now_ms().max(parent.timestamp);
        if !shared
            .engine
            .can_propose(&parent, timestamp, shared.node_id)
        {
            // Not the slot leader: wait for the leader's block to move the
            // tip, or poll again once the fallback window may have opened.
            tokio::select! {
                _ = tip_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            continue;
        }

        let cancel = CancelToken::new();
        *shared.active_cancel.lock().unwrap() = cancel.clone();
        // A block may have arrived between reading `parent` and arming the
        // token; restart the round so mining never starts on a stale tip.
        if shared.store.lock().await.current_tip().as_deref() != Some(parent.hash.as_str()) {
            continue;
        }

        let transactions = shared
            .pool
            .lock()
            .await
            .select_for_block(shared.engine.max_block_txs());

        let round_started = Instant::now();
        let mining = {
            let shared = Arc::clone(&shared);
            let parent = parent.clone();
            let cancel = cancel.clone();
            let txs = transactions.clone();
            tokio::task::spawn_blocking(move || {
                let timer = shared.metrics.node.block_production_seconds.start_timer();
                let outcome =
                    shared
                        .engine
                        .produce(&parent, txs, shared.node_id, timestamp, &cancel);
                timer.observe_duration();
                outcome
            })
        };
        let outcome = mining.await.unwrap_or(ProduceOutcome::Cancelled);

        match outcome {
            ProduceOutcome::Produced(block) => {
                let (insert_outcome, new_tip) = {
                    let mut store = shared.store.lock().await;
                    let outcome = store.insert(block.clone(), shared.engine.as_chain_rules());
                    apply_chain_events(&shared, &mut store);
                    (outcome, store.current_tip())
                };
                if insert_outcome == InsertOutcome::Accepted {
                    shared.metrics.node.blocks_accepted.inc();
                    shared.transport.mark_seen(&block.hash);
                    events::block_created(shared.node_id, block.height, &block.hash);
                    shared.transport.broadcast(Message::Block { block });
                } else {
                    tracing::warn!(
                        node_id = shared.node_id,
                        ?insert_outcome,
                        "self-produced block was not accepted locally"
                    );
                }
                if new_tip.as_deref() != Some(parent.hash.as_str()) {
                    update_local_tip(&shared).await;
                    let _ = shared.tip_tx.send(new_tip);
                }
                // One block per block-time window. The sleep is not cut
                // short by tip changes: a node that re-mined on every
                // fork-choice switch would drive the chain at gossip speed
                // instead of the configured block rate.
                let remaining = shared
                    .engine
                    .block_interval()
                    .saturating_sub(round_started.elapsed());
                if !remaining.is_zero() {
                    tokio::time::sleep(remaining).await;
                }
            }
            ProduceOutcome::NotEligible => {
                tokio::select! {
                    _ = tip_rx.changed() => {}
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
            ProduceOutcome::Cancelled => {
                // Tip changed mid-mine, or the nonce budget ran out. Return
                // the unused transactions and pick up the new tip.
                if !transactions.is_empty() {
                    let mut pool = shared.pool.lock().await;
                    for tx in transactions {
                        pool.submit(tx);
                    }
                }
            }
        }
    }
}

/// Applies pending [`ChainEvent`]s from the store: logs them, updates
/// metrics, and halts the node on a safety violation.
fn apply_chain_events(shared: &Arc<Shared>, store: &mut ChainStore) {
    for event in store.take_events() {
        events::chain_event(shared.node_id, &event);
        match event {
            ChainEvent::Reorg { .. } => shared.metrics.node.reorgs_total.inc(),
            ChainEvent::SafetyViolation { .. } => {
                shared.metrics.node.safety_violations_total.inc();
                shared.halted.store(true, Ordering::SeqCst);
                shared.cancel_active_production();
            }
            _ => {}
        }
    }
}

async fn update_local_tip(shared: &Arc<Shared>) {
    let store = shared.store.lock().await;
    let Some(tip_hash) = store.current_tip() else {
        return;
    };
    let score = shared.engine.as_chain_rules().score(&store, &tip_hash);
    shared
        .transport
        .set_local_tip(tip_hash, ScoreSummary::from(&score));
}

async fn handle_inbound(shared: &Arc<Shared>, from_peer: u64, msg: Message) {
    match msg {
        Message::Block { block } => {
            events::block_received(shared.node_id, from_peer, &block.hash);
            let mut store = shared.store.lock().await;
            let tip_before = store.current_tip();
            let timer = shared.metrics.node.block_validation_seconds.start_timer();
            let outcome = store.insert(block.clone(), shared.engine.as_chain_rules());
            timer.observe_duration();
            match &outcome {
                InsertOutcome::Accepted => {
                    shared.metrics.node.blocks_accepted.inc();
                    events::block_accepted(shared.node_id, block.height, &block.hash);
                    // Flood with source suppression, now that the block is
                    // known to be valid.
                    shared.transport.broadcast_except(
                        Message::Block {
                            block: block.clone(),
                        },
                        from_peer,
                    );
                }
                InsertOutcome::Invalid(reason) => {
                    shared.metrics.node.blocks_rejected.inc();
                    events::block_rejected(shared.node_id, &block.hash, reason);
                }
                _ => {}
            }
            apply_chain_events(shared, &mut store);
            if outcome == InsertOutcome::Orphaned && !store.is_pending(&block.prev_hash) {
                // Only ask for parents that are truly unknown; a parent
                // already buffered in the pending pool is part of a
                // catch-up stride that is still being walked back.
                tracing::debug!(
                    node_id = shared.node_id,
                    hash = %block.hash,
                    parent = %block.prev_hash,
                    "orphan buffered, requesting parent"
                );
                shared
                    .transport
                    .send_to(from_peer, Message::GetBlock { hash: block.prev_hash });
            }
            let tip_after = store.current_tip();
            drop(store);
            if tip_after != tip_before {
                shared.cancel_active_production();
                update_local_tip(shared).await;
                let _ = shared.tip_tx.send(tip_after);
            }
        }
        Message::GetBlock { hash } => {
            let store = shared.store.lock().await;
            if let Some(chain) = store.chain_to(&hash) {
                let start = chain.len().saturating_sub(CATCHUP_WINDOW);
                shared.transport.send_to(
                    from_peer,
                    Message::Blocks {
                        blocks: chain[start..].to_vec(),
                    },
                );
            }
        }
        Message::Hello {
            tip_hash, tip_score, ..
        } => {
            // Catch-up path: fetch the peer's tip if we don't know it and
            // its advertised score is at least as good as ours (equal
            // scores can still differ in the hash tie-break).
            let Some(hash) = tip_hash else { return };
            let store = shared.store.lock().await;
            if store.get_block(&hash).is_some() {
                return;
            }
            let ours = store.current_tip().map(|tip| {
                ScoreSummary::from(&shared.engine.as_chain_rules().score(&store, &tip))
            });
            drop(store);
            let worth_fetching = match (tip_score, ours) {
                (Some(theirs), Some(mine)) => theirs >= mine,
                _ => true,
            };
            if worth_fetching {
                shared
                    .transport
                    .send_to(from_peer, Message::GetBlock { hash });
            }
        }
        Message::Blocks { .. } | Message::Ping { .. } | Message::Pong { .. } => {
            // Catch-up batches are unpacked by the transport and arrive
            // here as individual `Block` messages; Ping/Pong never leave
            // the transport layer.
        }
    }
}

async fn run_tx_generation_loop(shared: Arc<Shared>, seed: u64, node_id: u64, peer_count: u64) {
    let mut generator = SyntheticTxGenerator::new(seed, node_id);
    loop {
        if shared.deadline_passed() {
            return;
        }
        let timestamp = {
            let store = shared.store.lock().await;
            store
                .current_tip()
                .and_then(|tip| store.get_block(&tip).map(|b| b.timestamp))
                .unwrap_or(0)
        };
        let tx = generator.next(peer_count, timestamp);
        shared.pool.lock().await.submit(tx);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

async fn run_metrics_loop(shared: Arc<Shared>) {
    loop {
        if shared.deadline_passed() {
            return;
        }
        {
            let store = shared.store.lock().await;
            if let Some(tip) = store.current_tip() {
                if let Some(block) = store.get_block(&tip) {
                    shared.metrics.node.tip_height.set(block.height as f64);
                }
            }
        }
        shared
            .metrics
            .node
            .mempool_size
            .set(shared.pool.lock().await.len() as f64);
        shared
            .metrics
            .node
            .connected_peers
            .set(shared.transport.connected_peer_count() as f64);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
