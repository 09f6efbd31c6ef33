//! Network scenario injection: artificial delay and partition.

pub mod delay;
pub mod partition;

pub use delay::DelayScenario;
pub use partition::PartitionScenario;

/// A filter a scenario applies to a single outbound message hop from
/// `from` to `to`. Returning `None` drops the message (partitioned);
/// returning `Some(delay)` holds it for `delay` before delivery.
pub trait ScenarioFilter: Send + Sync {
    fn delay_for(&mut self, from: u64, to: u64, now_ms: u64) -> Option<std::time::Duration>;
}

/// No-op scenario: every message is delivered immediately.
pub struct NoScenario;

impl ScenarioFilter for NoScenario {
    fn delay_for(&mut self, _from: u64, _to: u64, _now_ms: u64) -> Option<std::time::Duration> {
        Some(std::time::Duration::ZERO)
    }
}
