//! Seeded RNG shared by the simulator.
//!
//! Measurement noise and injected failures draw from one generator so that a
//! seed reproduces a whole simulated run.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;

/// Thread-safe, optionally seeded generator.
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Generator seeded with `seed`, or from the OS when `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        Self { inner: Mutex::new(rng) }
    }

    /// True with probability `rate`; rates outside `[0, 1]` are clamped.
    pub fn chance(&self, rate: f64) -> bool {
        match rate {
            r if r.is_nan() || r <= 0.0 => false,
            r if r >= 1.0 => true,
            r => self.inner.lock().gen_bool(r),
        }
    }

    /// Uniform value in `[-amplitude, amplitude]`.
    pub fn noise(&self, amplitude: f64) -> f64 {
        let amplitude = amplitude.abs();
        if amplitude == 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..=amplitude)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for MockRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockRng").finish_non_exhaustive()
    }
}
