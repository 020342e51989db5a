use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The single source of scheduling randomness.
///
/// Node-rank perturbation and retry jitter both draw from here, so seeding it
/// makes every scheduling decision reproducible.
#[derive(Debug)]
pub struct RandomSource {
    rng: Mutex<StdRng>,
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl RandomSource {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniform integer in `[0, max]`.
    pub fn jitter(&self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..=max),
            // A panicked holder leaves the RNG state valid; keep drawing from it.
            Err(poisoned) => poisoned.into_inner().gen_range(0..=max),
        }
    }

    /// `delay` plus up to `range_percent` percent of itself.
    pub fn jittered_delay(&self, delay: Duration, range_percent: u32) -> Duration {
        let percent = self.jitter(range_percent);
        delay + delay.mul_f64(f64::from(percent) / 100.0)
    }

    /// Uniform duration in `[min, max]`, used by worker dequeue backoff.
    pub fn duration_between(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span_ms = (max - min).as_millis().min(u128::from(u32::MAX)) as u32;
        min + Duration::from_millis(u64::from(self.jitter(span_ms)))
    }
}
