//! `sim-node` binary: runs one peer of a simulated consensus network.

mod cli;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;

use sim_chain::config::{self, PartitionConfig};
use sim_chain::consensus::{ConsensusEngine, HybridEngine, PowEngine};
use sim_chain::logging::events;
use sim_chain::metrics::{run_metrics_http_server, MetricsRegistry};
use sim_chain::net::Transport;
use sim_chain::scenario::{DelayScenario, NoScenario, PartitionScenario, ScenarioFilter};
use sim_chain::scheduler::DEFAULT_RUN_BUDGET;
use sim_chain::types::Block;
use sim_chain::{NodeError, NodeScheduler, RunOutcome};

use cli::{Cli, ConsensusArg, ScenarioArg};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _log_guard = match sim_chain::logging::init(cli.node_id, &cli.log_level) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialise logging: {err}");
            std::process::exit(1);
        }
    };

    let listen_addr = config::node_addr(cli.node_id);
    events::startup(cli.node_id, consensus_name(cli.consensus), &listen_addr);

    let outcome = match run(&cli, &listen_addr).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(%err, "node exited with error");
            events::shutdown(cli.node_id, &format!("error: {err}"));
            std::process::exit(1);
        }
    };

    match outcome {
        RunOutcome::RunBudgetExpired => {
            events::shutdown(cli.node_id, "run_budget_expired");
            std::process::exit(0);
        }
        RunOutcome::SafetyViolation => {
            events::shutdown(cli.node_id, "safety_violation");
            std::process::exit(1);
        }
    }
}

fn consensus_name(consensus: ConsensusArg) -> &'static str {
    match consensus {
        ConsensusArg::Pow => "pow",
        ConsensusArg::Hybrid => "hybrid",
    }
}

/// Metrics are ambient to the simulation (not part of the consensus wire
/// contract), so their address just needs to be collision-free across
/// nodes on one machine: offset the node's gossip port by 1000.
fn metrics_addr(node_id: u64) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10_000 + node_id as u16))
}

async fn run(cli: &Cli, listen_addr: &str) -> Result<RunOutcome, NodeError> {
    let metrics = Arc::new(MetricsRegistry::new(cli.node_id)?);
    {
        let metrics = Arc::clone(&metrics);
        let addr = metrics_addr(cli.node_id);
        tokio::spawn(async move {
            if let Err(err) = run_metrics_http_server(metrics, addr).await {
                tracing::warn!(%err, "metrics HTTP server error");
            }
        });
        tracing::info!(addr = %metrics_addr(cli.node_id), "metrics exporter listening");
    }

    let (engine, node_count, finality_depth): (Box<dyn ConsensusEngine>, usize, u64) =
        match cli.consensus {
            ConsensusArg::Pow => {
                let pow = config::load_pow_config(&cli.config_dir)?;
                let node_count = pow.node_count();
                let finality_depth = pow.finality_depth;
                (Box::new(PowEngine::new(pow)), node_count, finality_depth)
            }
            ConsensusArg::Hybrid => {
                let hybrid = config::load_hybrid_config(&cli.config_dir)?;
                let node_count = hybrid.node_count();
                let finality_depth = hybrid.finality_depth;
                (
                    Box::new(HybridEngine::new(hybrid)),
                    node_count,
                    finality_depth,
                )
            }
        };

    let (transport, inbound_rx) = Transport::new(cli.node_id, node_count);
    Arc::clone(&transport).listen(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "listening for peers");

    let peers: Vec<u64> = (0..node_count as u64).filter(|&id| id != cli.node_id).collect();
    for peer_id in &peers {
        let transport = Arc::clone(&transport);
        let addr = config::node_addr(*peer_id);
        tokio::spawn(transport.dial_with_retry(*peer_id, addr));
    }

    let scenario: Box<dyn ScenarioFilter> = match cli.scenario {
        ScenarioArg::None => Box::new(NoScenario),
        ScenarioArg::Delays => Box::new(DelayScenario::new(cli.seed)),
        ScenarioArg::Partition => {
            let partition = config::load_partition_config(&cli.config_dir).unwrap_or_else(|err| {
                tracing::warn!(%err, "failed to load partition_config.json, using default split");
                PartitionConfig::default()
            });
            events::partition_start(cli.node_id, &partition.group_a, &partition.group_b);
            spawn_partition_heal_logger(cli.node_id, partition.heal_at_ms);
            Box::new(PartitionScenario::new(partition))
        }
    };
    transport.set_scenario(scenario);

    let genesis = Block::genesis();
    let scheduler = NodeScheduler::new(
        cli.node_id,
        cli.seed,
        peers.len() as u64,
        finality_depth,
        genesis,
        engine,
        transport,
        metrics,
        DEFAULT_RUN_BUDGET,
    );

    let outcome = tokio::select! {
        outcome = scheduler.run(inbound_rx) => {
            tracing::info!(?outcome, "node run completed");
            outcome
        }
        _ = signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            scheduler.shutdown();
            RunOutcome::RunBudgetExpired
        }
    };

    Ok(outcome)
}

/// Logs the required `partition_heal` event once the scenario's scheduled
/// heal time arrives. The filter itself (in [`PartitionScenario`]) already
/// stops dropping messages at that point independently of this task; this
/// just produces the log record.
fn spawn_partition_heal_logger(node_id: u64, heal_at_ms: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(heal_at_ms)).await;
        events::partition_heal(node_id);
    });
}
