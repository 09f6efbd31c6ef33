//! Uniform random per-hop delay, deterministic given a seed.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::scenario::ScenarioFilter;

const MIN_DELAY_MS: u64 = 50;
const MAX_DELAY_MS: u64 = 200;

/// Delays every hop by a uniformly random amount in `[50, 200]` ms. Each
/// ordered `(from, to)` pair gets its own RNG stream, seeded from the
/// scenario seed, so delays are reproducible across runs but independent
/// per link: a run with the same seed produces the same sequence of
/// delays for the same link, in the order they are requested.
pub struct DelayScenario {
    seed: u64,
    rngs: HashMap<(u64, u64), SmallRng>,
}

impl DelayScenario {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rngs: HashMap::new(),
        }
    }

    fn rng_for(&mut self, from: u64, to: u64) -> &mut SmallRng {
        self.rngs.entry((from, to)).or_insert_with(|| {
            let link_seed = self
                .seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(from.wrapping_mul(31))
                .wrapping_add(to);
            SmallRng::seed_from_u64(link_seed)
        })
    }
}

impl ScenarioFilter for DelayScenario {
    fn delay_for(&mut self, from: u64, to: u64, _now_ms: u64) -> Option<Duration> {
        let rng = self.rng_for(from, to);
        let ms = rng.gen_range(MIN_DELAY_MS..=MAX_DELAY_MS);
        Some(Duration::from_millis(ms))
    }
}
