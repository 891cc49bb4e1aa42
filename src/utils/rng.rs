//! Deterministic random source for parameter initialization.
//!
//! A seeded xorshift generator keeps weight initialization reproducible
//! across runs and platforms.

use std::f32::consts::PI;

/// Xorshift PRNG with a Box-Muller normal sampler.
pub struct SimpleRng {
    state: u64,
    spare: Option<f32>,
}

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e3779b97f4a7c15 } else { seed };
        Self { state, spare: None }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Uniform sample in [0, 1].
    pub fn next_f32(&mut self) -> f32 {
        self.next_u32() as f32 / u32::MAX as f32
    }

    /// Uniform sample in [low, high].
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Standard normal sample.
    ///
    /// Box-Muller produces samples in pairs; the second one is cached and
    /// returned by the next call.
    pub fn next_gaussian(&mut self) -> f32 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        // u1 must stay away from zero for the log.
        let u1 = self.next_f32().max(f32::MIN_POSITIVE);
        let u2 = self.next_f32();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;
        self.spare = Some(radius * theta.sin());
        radius * theta.cos()
    }

    /// Fill `data` with `scale * N(0, 1)` samples.
    pub fn fill_gaussian(&mut self, data: &mut [f32], scale: f32) {
        for value in data.iter_mut() {
            *value = scale * self.next_gaussian();
        }
    }
}
