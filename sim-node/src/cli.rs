//! Command-line interface for a single simulated node.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "sim-node",
    about = "Runs one peer of a simulated blockchain consensus network"
)]
pub struct Cli {
    /// This node's numeric id in `[0, N)`, used for its listen address
    /// (`127.0.0.1:9000 + node_id`), stake lookup, leader election, and as
    /// the sender address for synthetic transactions.
    #[arg(long)]
    pub node_id: u64,

    /// Which consensus engine this node runs. Must match every other node
    /// in the same simulation run.
    #[arg(long, value_enum)]
    pub consensus: ConsensusArg,

    /// Network scenario to inject. `none` is an implementer's convenience
    /// for local development; a real simulation run picks `delays` or
    /// `partition`.
    #[arg(long, value_enum)]
    pub scenario: ScenarioArg,

    /// Deterministic seed for synthetic transaction generation and for
    /// simulated per-link latency / partition scheduling.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Directory containing `pow_config.json` / `hybrid_config.json` and,
    /// for the partition scenario, `partition_config.json`.
    #[arg(long, default_value = "config")]
    pub config_dir: String,

    /// Log verbosity when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConsensusArg {
    Pow,
    Hybrid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ScenarioArg {
    None,
    Delays,
    Partition,
}
