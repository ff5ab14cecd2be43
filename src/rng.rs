//! Pluggable random-number source consumed by the alias tables and the
//! sample executor. Any `rand::Rng` satisfies it, so production code plugs
//! in `rand::rngs::StdRng` directly while tests can hand in a seeded RNG
//! for reproducibility.

use rand::Rng;

pub trait RngSource {
    /// Draw a uniform integer in `[0, k)`.
    fn uniform(&mut self, k: usize) -> usize;
    /// Draw a uniform float in `[0, 1)`.
    fn uniform01(&mut self) -> f64;
}

impl<R: Rng> RngSource for R {
    fn uniform(&mut self, k: usize) -> usize {
        debug_assert!(k > 0, "uniform(0) has no valid outcome");
        self.gen_range(0..k)
    }

    fn uniform01(&mut self) -> f64 {
        self.gen::<f64>()
    }
}
