//! Socket-level end-to-end runs: several in-process nodes, each with its
//! own TCP transport and scheduler, exercised under injected network
//! scenarios. The quick tests below use small block times and short run
//! budgets; the `#[ignore]`d ones run the full five-node, 30-second
//! configurations and are meant for manual / nightly invocation
//! (`cargo test -- --ignored`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sim_chain::config::{HybridConfig, PartitionConfig, PowConfig};
use sim_chain::consensus::{ConsensusEngine, HybridEngine, PowEngine};
use sim_chain::invariants::check_no_double_spend;
use sim_chain::metrics::MetricsRegistry;
use sim_chain::net::Transport;
use sim_chain::scenario::{DelayScenario, NoScenario, PartitionScenario, ScenarioFilter};
use sim_chain::types::Block;
use sim_chain::{NodeScheduler, RunOutcome};

struct ClusterNode {
    scheduler: Arc<NodeScheduler>,
    outcome: RunOutcome,
}

fn addr_of(base_port: u16, node_id: u64) -> String {
    format!("127.0.0.1:{}", base_port + node_id as u16)
}

/// Starts one in-process node: transport listening on `base_port +
/// node_id`, dialers to every peer, scenario installed, scheduler spawned.
async fn start_node(
    base_port: u16,
    node_id: u64,
    node_count: u64,
    finality_depth: u64,
    run_budget: Duration,
    engine: Box<dyn ConsensusEngine>,
    scenario: Box<dyn ScenarioFilter>,
) -> (Arc<NodeScheduler>, tokio::task::JoinHandle<RunOutcome>) {
    let (transport, inbound_rx) = Transport::new(node_id, node_count as usize);
    Arc::clone(&transport)
        .listen(&addr_of(base_port, node_id))
        .await
        .expect("bind test listener");
    for peer_id in (0..node_count).filter(|&id| id != node_id) {
        tokio::spawn(Arc::clone(&transport).dial_with_retry(peer_id, addr_of(base_port, peer_id)));
    }
    transport.set_scenario(scenario);

    let metrics = Arc::new(MetricsRegistry::new(node_id).expect("metrics registry"));
    let scheduler = Arc::new(NodeScheduler::new(
        node_id,
        42,
        node_count.saturating_sub(1),
        finality_depth,
        Block::genesis(),
        engine,
        transport,
        metrics,
        run_budget,
    ));
    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(inbound_rx).await })
    };
    (scheduler, run)
}

async fn run_cluster(
    base_port: u16,
    node_count: u64,
    finality_depth: u64,
    run_budget: Duration,
    engine_for: impl Fn(u64) -> Box<dyn ConsensusEngine>,
    scenario_for: impl Fn(u64) -> Box<dyn ScenarioFilter>,
) -> Vec<ClusterNode> {
    let mut started = Vec::new();
    for node_id in 0..node_count {
        started.push(
            start_node(
                base_port,
                node_id,
                node_count,
                finality_depth,
                run_budget,
                engine_for(node_id),
                scenario_for(node_id),
            )
            .await,
        );
    }

    let mut nodes = Vec::new();
    for (scheduler, handle) in started {
        let outcome = handle.await.expect("node task panicked");
        nodes.push(ClusterNode { scheduler, outcome });
    }
    nodes
}

async fn finalised_view(node: &ClusterNode) -> (u64, HashMap<u64, String>) {
    node.scheduler
        .with_store(|store| {
            let final_height = store.final_height();
            let map = (0..=final_height)
                .filter_map(|h| store.finalised_at(h).map(|hash| (h, hash)))
                .collect();
            (final_height, map)
        })
        .await
}

/// Agreement across the whole cluster: any height finalised by two nodes
/// carries the same hash on both.
async fn assert_finalised_agreement(nodes: &[ClusterNode]) {
    let mut views = Vec::new();
    for node in nodes {
        views.push(finalised_view(node).await);
    }
    for (i, (_, a)) in views.iter().enumerate() {
        for (j, (_, b)) in views.iter().enumerate().skip(i + 1) {
            for (height, hash) in a {
                if let Some(other) = b.get(height) {
                    assert_eq!(
                        hash, other,
                        "nodes {i} and {j} disagree on finalised hash at height {height}"
                    );
                }
            }
        }
    }
}

fn pow_engine(difficulty: u32, block_time_ms: u64) -> Box<dyn ConsensusEngine> {
    Box::new(PowEngine::new(PowConfig {
        difficulty,
        block_time_ms,
        ..Default::default()
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pow_cluster_with_delays_finalises_a_common_prefix() {
    let nodes = run_cluster(
        19100,
        3,
        4,
        Duration::from_secs(6),
        |_| pow_engine(1, 400),
        |_| Box::new(DelayScenario::new(42)),
    )
    .await;

    for node in &nodes {
        assert_eq!(node.outcome, RunOutcome::RunBudgetExpired);
        let (final_height, _) = finalised_view(node).await;
        assert!(final_height >= 3, "final_height stalled at {final_height}");
    }
    assert_finalised_agreement(&nodes).await;

    // The finalised prefix must also be free of double spends.
    let violations = nodes[0]
        .scheduler
        .with_store(|store| {
            let tip = store.current_tip().expect("tip");
            let chain = store.chain_to(&tip).expect("chain to tip");
            check_no_double_spend(&chain)
        })
        .await;
    assert!(violations.is_empty(), "double spends: {violations:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partition_heals_and_cluster_reconverges() {
    // Block time and finality depth are sized so neither side of the
    // partition can bury a block k deep before the heal; convergence then
    // never has to contradict recorded finality.
    let partition = PartitionConfig {
        group_a: vec![0, 1],
        group_b: vec![2],
        heal_at_ms: 2_000,
    };
    let nodes = run_cluster(
        19200,
        3,
        6,
        Duration::from_secs(9),
        |_| pow_engine(1, 600),
        |_| Box::new(PartitionScenario::new(partition.clone())),
    )
    .await;

    for node in &nodes {
        assert_eq!(
            node.outcome,
            RunOutcome::RunBudgetExpired,
            "a node halted on a safety violation"
        );
        let (final_height, _) = finalised_view(node).await;
        assert!(
            final_height >= 3,
            "node did not converge past the heal, final_height = {final_height}"
        );
    }
    assert_finalised_agreement(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_finalises_one_block_per_window() {
    let nodes = run_cluster(
        19300,
        1,
        4,
        Duration::from_secs(3),
        |_| pow_engine(2, 100),
        |_| Box::new(NoScenario),
    )
    .await;

    assert_eq!(nodes[0].outcome, RunOutcome::RunBudgetExpired);
    let (final_height, map) = finalised_view(&nodes[0]).await;
    assert!(final_height >= 5, "final_height = {final_height}");
    for h in 0..=final_height {
        assert!(map.contains_key(&h), "gap in finalised prefix at {h}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joining_node_catches_up_via_hello() {
    let base_port = 19400;
    let full_budget = Duration::from_secs(6);

    let (s0, h0) = start_node(
        base_port,
        0,
        3,
        4,
        full_budget,
        pow_engine(1, 300),
        Box::new(NoScenario),
    )
    .await;
    let (s1, h1) = start_node(
        base_port,
        1,
        3,
        4,
        full_budget,
        pow_engine(1, 300),
        Box::new(NoScenario),
    )
    .await;

    // Let the first two build a chain the newcomer has never seen.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let (s2, h2) = start_node(
        base_port,
        2,
        3,
        4,
        full_budget - Duration::from_secs(2),
        pow_engine(1, 300),
        Box::new(NoScenario),
    )
    .await;

    let outcomes = [
        h0.await.expect("node 0 panicked"),
        h1.await.expect("node 1 panicked"),
        h2.await.expect("node 2 panicked"),
    ];
    assert!(outcomes.iter().all(|o| *o == RunOutcome::RunBudgetExpired));

    let nodes = [s0, s1, s2]
        .into_iter()
        .zip(outcomes)
        .map(|(scheduler, outcome)| ClusterNode { scheduler, outcome })
        .collect::<Vec<_>>();
    let (late_final, _) = finalised_view(&nodes[2]).await;
    assert!(
        late_final >= 1,
        "late joiner never caught up, final_height = {late_final}"
    );
    assert_finalised_agreement(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hybrid_cluster_finalises_with_elected_or_fallback_proposers() {
    let config = HybridConfig {
        light_difficulty: 1,
        block_time_ms: 300,
        stakes: vec![200, 300, 150],
        leader_timeout_ms: 1000,
        finality_depth: 4,
    };
    let nodes = run_cluster(
        19500,
        3,
        4,
        Duration::from_secs(6),
        |_| Box::new(HybridEngine::new(config.clone())),
        |_| Box::new(NoScenario),
    )
    .await;

    for node in &nodes {
        assert_eq!(node.outcome, RunOutcome::RunBudgetExpired);
        let (final_height, _) = finalised_view(node).await;
        assert!(final_height >= 3, "final_height = {final_height}");
    }
    assert_finalised_agreement(&nodes).await;

    // Every accepted block was proposed by its slot's elected leader, or
    // came through the leader-timeout fallback path.
    let engine = HybridEngine::new(config);
    let chain = nodes[0]
        .scheduler
        .with_store(|store| {
            let tip = store.current_tip().expect("tip");
            store.chain_to(&tip).expect("chain to tip")
        })
        .await;
    for window in chain.windows(2) {
        let (parent, block) = (&window[0], &window[1]);
        let elected = engine.leader_for(&parent.hash, block.height);
        let fallback = block.timestamp.saturating_sub(parent.timestamp) >= 1000;
        assert!(
            elected == Some(block.proposer_id) || fallback,
            "height {} proposed by {} but leader was {elected:?}",
            block.height,
            block.proposer_id
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "full five-node 30s run"]
async fn five_pow_nodes_under_delays_reach_final_height_three() {
    let nodes = run_cluster(
        19600,
        5,
        4,
        Duration::from_secs(30),
        |_| pow_engine(4, 1000),
        |_| Box::new(DelayScenario::new(42)),
    )
    .await;

    for node in &nodes {
        assert_eq!(node.outcome, RunOutcome::RunBudgetExpired);
        let (final_height, _) = finalised_view(node).await;
        assert!(final_height >= 3, "final_height = {final_height}");
    }
    assert_finalised_agreement(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "full five-node 30s run"]
async fn five_pow_nodes_survive_partition_and_heal() {
    // A 15s partition with a 5s block time keeps each side's divergence
    // shallower than the finality depth, so the post-heal reorg never
    // touches a finalised block.
    let partition = PartitionConfig {
        group_a: vec![0, 1],
        group_b: vec![2, 3, 4],
        heal_at_ms: 15_000,
    };
    let nodes = run_cluster(
        19700,
        5,
        4,
        Duration::from_secs(30),
        |_| pow_engine(2, 5000),
        |_| Box::new(PartitionScenario::new(partition.clone())),
    )
    .await;

    for node in &nodes {
        assert_eq!(node.outcome, RunOutcome::RunBudgetExpired);
    }
    assert_finalised_agreement(&nodes).await;

    // After the heal every node should sit on one common chain.
    let mut tips = std::collections::HashSet::new();
    for node in &nodes {
        let tip_chain_start = node
            .scheduler
            .with_store(|store| {
                let tip = store.current_tip().expect("tip");
                store.chain_to(&tip).expect("chain")[..2].to_vec()
            })
            .await;
        tips.insert(tip_chain_start[1].hash.clone());
    }
    assert_eq!(tips.len(), 1, "cluster still split across {tips:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "full five-node 30s run"]
async fn five_hybrid_nodes_under_delays_follow_stake_weighted_leaders() {
    let config = HybridConfig {
        light_difficulty: 2,
        block_time_ms: 1000,
        stakes: vec![200, 300, 150, 250, 100],
        leader_timeout_ms: 1000,
        finality_depth: 4,
    };
    let nodes = run_cluster(
        19800,
        5,
        4,
        Duration::from_secs(30),
        |_| Box::new(HybridEngine::new(config.clone())),
        |_| Box::new(DelayScenario::new(42)),
    )
    .await;

    for node in &nodes {
        assert_eq!(node.outcome, RunOutcome::RunBudgetExpired);
    }
    assert_finalised_agreement(&nodes).await;

    let engine = HybridEngine::new(config);
    let chain = nodes[0]
        .scheduler
        .with_store(|store| {
            let tip = store.current_tip().expect("tip");
            store.chain_to(&tip).expect("chain")
        })
        .await;
    for window in chain.windows(2) {
        let (parent, block) = (&window[0], &window[1]);
        let elected = engine.leader_for(&parent.hash, block.height);
        let fallback = block.timestamp.saturating_sub(parent.timestamp) >= 1000;
        assert!(elected == Some(block.proposer_id) || fallback);
    }
}
