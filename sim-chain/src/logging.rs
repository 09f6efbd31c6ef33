//! Structured event logging.
//!
//! Every node writes one JSON object per line to `logs/node_<id>.log`:
//! `{"timestamp": ..., "node_id": ..., "event_type": "...", "data": {...}}`.
//! This is a fixed wire contract a post-run analysis pass parses, so it
//! bypasses `tracing`'s own JSON formatter (whose field layout isn't under
//! our control) and writes directly through `tracing-appender`'s
//! non-blocking file writer. A separate human-readable `tracing` layer on
//! stderr is kept for interactive debugging.

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static EVENT_WRITER: OnceLock<NonBlocking> = OnceLock::new();

/// Initialises stderr tracing and the per-node JSON event log under
/// `logs/node_<id>.log`.
///
/// Returns a [`WorkerGuard`] that must be kept alive for the lifetime of
/// the process; dropping it flushes and stops the non-blocking file
/// writer.
pub fn init(node_id: u64, level: &str) -> std::io::Result<WorkerGuard> {
    let log_dir = Path::new("logs");
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, format!("node_{node_id}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = EVENT_WRITER.set(non_blocking);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sim_chain={level},sim_node={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(guard)
}

fn write_event(node_id: u64, event_type: &str, data: serde_json::Value) {
    let Some(writer) = EVENT_WRITER.get() else {
        return;
    };
    let line = serde_json::json!({
        "timestamp": crate::time::now_ms(),
        "node_id": node_id,
        "event_type": event_type,
        "data": data,
    });
    let mut writer = writer.clone();
    let _ = writeln!(writer, "{line}");
}

/// Event kinds logged at the points the scheduler and chain store hit
/// them, matching the required `event_type` set exactly.
pub mod events {
    use super::write_event;
    use crate::chain::ChainEvent;
    use serde_json::json;

    pub fn startup(node_id: u64, consensus: &str, listen_addr: &str) {
        write_event(
            node_id,
            "startup",
            json!({ "consensus": consensus, "listen_addr": listen_addr }),
        );
        tracing::info!(node_id, consensus, listen_addr, "node starting");
    }

    pub fn shutdown(node_id: u64, reason: &str) {
        write_event(node_id, "shutdown", json!({ "reason": reason }));
        tracing::info!(node_id, reason, "node shutting down");
    }

    pub fn peer_connected(node_id: u64, peer_id: u64) {
        write_event(node_id, "peer_connected", json!({ "peer_id": peer_id }));
        tracing::info!(node_id, peer_id, "peer connected");
    }

    pub fn peer_disconnected(node_id: u64, peer_id: u64) {
        write_event(node_id, "peer_disconnected", json!({ "peer_id": peer_id }));
        tracing::warn!(node_id, peer_id, "peer disconnected");
    }

    pub fn block_created(node_id: u64, height: u64, hash: &str) {
        write_event(
            node_id,
            "block_created",
            json!({ "height": height, "hash": hash }),
        );
        tracing::info!(node_id, height, hash, "block created");
    }

    pub fn block_received(node_id: u64, from_peer: u64, hash: &str) {
        write_event(
            node_id,
            "block_received",
            json!({ "from_peer": from_peer, "hash": hash }),
        );
        tracing::info!(node_id, from_peer, hash, "block received");
    }

    pub fn block_accepted(node_id: u64, height: u64, hash: &str) {
        write_event(
            node_id,
            "block_accepted",
            json!({ "height": height, "hash": hash }),
        );
        tracing::info!(node_id, height, hash, "block accepted");
    }

    pub fn block_rejected(node_id: u64, hash: &str, reason: &str) {
        write_event(
            node_id,
            "block_rejected",
            json!({ "hash": hash, "reason": reason }),
        );
        tracing::warn!(node_id, hash, reason, "block rejected");
    }

    pub fn partition_start(node_id: u64, group_a: &[u64], group_b: &[u64]) {
        write_event(
            node_id,
            "partition_start",
            json!({ "group_a": group_a, "group_b": group_b }),
        );
        tracing::warn!(node_id, "network partition started");
    }

    pub fn partition_heal(node_id: u64) {
        write_event(node_id, "partition_heal", json!({}));
        tracing::info!(node_id, "network partition healed");
    }

    /// Dispatches a [`ChainEvent`] raised by the chain store to the
    /// matching required `event_type`.
    pub fn chain_event(node_id: u64, event: &ChainEvent) {
        match event {
            ChainEvent::TipChanged { old, new } => {
                write_event(
                    node_id,
                    "tip_changed",
                    json!({ "old": old, "new": new }),
                );
                tracing::info!(node_id, old = ?old, new, "tip changed");
            }
            ChainEvent::Reorg {
                from_height,
                to_height,
            } => {
                write_event(
                    node_id,
                    "reorg",
                    json!({ "from_height": from_height, "to_height": to_height }),
                );
                tracing::warn!(node_id, from_height, to_height, "reorg");
            }
            ChainEvent::Finalized { height, hash } => {
                write_event(
                    node_id,
                    "finalized",
                    json!({ "height": height, "hash": hash }),
                );
                tracing::info!(node_id, height, hash, "block finalized");
            }
            ChainEvent::SafetyViolation { height, a, b } => {
                write_event(
                    node_id,
                    "safety_violation",
                    json!({ "height": height, "a": a, "b": b }),
                );
                tracing::error!(node_id, height, a, b, "safety violation");
            }
        }
    }
}
