//! Fixed-group network partition with a scheduled heal.

use std::time::Duration;

use crate::config::PartitionConfig;
use crate::scenario::ScenarioFilter;

/// Splits nodes into two groups; messages crossing groups are dropped
/// until `heal_at_ms`, after which every message is delivered.
pub struct PartitionScenario {
    group_a: Vec<u64>,
    group_b: Vec<u64>,
    heal_at_ms: u64,
}

impl PartitionScenario {
    pub fn new(config: PartitionConfig) -> Self {
        Self {
            group_a: config.group_a,
            group_b: config.group_b,
            heal_at_ms: config.heal_at_ms,
        }
    }

    fn group_of(&self, node_id: u64) -> Option<u8> {
        if self.group_a.contains(&node_id) {
            Some(0)
        } else if self.group_b.contains(&node_id) {
            Some(1)
        } else {
            None
        }
    }

    fn healed(&self, now_ms: u64) -> bool {
        now_ms >= self.heal_at_ms
    }
}

impl ScenarioFilter for PartitionScenario {
    fn delay_for(&mut self, from: u64, to: u64, now_ms: u64) -> Option<Duration> {
        if self.healed(now_ms) {
            return Some(Duration::ZERO);
        }
        match (self.group_of(from), self.group_of(to)) {
            (Some(a), Some(b)) if a != b => None,
            _ => Some(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> PartitionScenario {
        PartitionScenario::new(PartitionConfig {
            group_a: vec![0, 1],
            group_b: vec![2, 3],
            heal_at_ms: 1000,
        })
    }

    #[test]
    fn cross_group_messages_are_dropped_before_heal() {
        let mut s = scenario();
        assert!(s.delay_for(0, 2, 500).is_none());
        assert!(s.delay_for(2, 1, 999).is_none());
    }

    #[test]
    fn same_group_messages_always_pass() {
        let mut s = scenario();
        assert!(s.delay_for(0, 1, 500).is_some());
        assert!(s.delay_for(2, 3, 500).is_some());
    }

    #[test]
    fn messages_pass_after_heal() {
        let mut s = scenario();
        assert!(s.delay_for(0, 2, 1000).is_some());
        assert!(s.delay_for(0, 2, 5000).is_some());
    }
}
