//! Error types shared across the chain, network, and configuration layers.

use thiserror::Error;

/// Errors produced while loading or validating node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    MissingFile(String),
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Errors produced by the gossip transport.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("connection closed")]
    Closed,
}

/// High level errors surfaced by the node scheduler.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("safety violation at height {height}: {a} != {b}")]
    SafetyViolation {
        height: u64,
        a: String,
        b: String,
    },
}
