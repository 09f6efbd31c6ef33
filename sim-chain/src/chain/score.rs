//! Comparable chain scores used by fork-choice.
//!
//! A [`Score`] is a 3-tuple ordered lexicographically: a primary weight
//! (chain length for PoW, stake-weighted total for Hybrid), a secondary
//! weight (chain length, used by Hybrid to break primary ties), and a
//! reversed tip hash so that, for otherwise-equal scores, the
//! lexicographically *smaller* hash compares as the *greater* `Score` and
//! therefore wins fork-choice. This keeps the chain store's fork-choice
//! logic identical for every consensus engine: take the maximum `Score`
//! over the tip set.

use std::cmp::Reverse;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Score {
    pub primary: u128,
    pub secondary: u64,
    pub tip_hash_rev: Reverse<String>,
}

impl Score {
    pub fn new(primary: u128, secondary: u64, tip_hash: &str) -> Self {
        Self {
            primary,
            secondary,
            tip_hash_rev: Reverse(tip_hash.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_primary_wins() {
        let a = Score::new(5, 0, "ffff");
        let b = Score::new(4, 0, "0000");
        assert!(a > b);
    }

    #[test]
    fn tie_on_primary_falls_to_secondary() {
        let a = Score::new(5, 2, "ffff");
        let b = Score::new(5, 1, "0000");
        assert!(a > b);
    }

    #[test]
    fn tie_on_primary_and_secondary_prefers_smaller_hash() {
        let a = Score::new(5, 2, "0000");
        let b = Score::new(5, 2, "ffff");
        assert!(a > b, "smaller tip hash should win the tie");
    }
}
