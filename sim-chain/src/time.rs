//! Wall-clock helpers.
//!
//! The simulator's consensus-visible state (block timestamps, hashes) never
//! depends on wall-clock time, but logging, liveness timeouts, and the
//! scheduler's run budget all need an actual clock reading.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
