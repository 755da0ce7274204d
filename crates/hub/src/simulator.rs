//! Fallback pH generator used while the sensor is silent.
//!
//! A bounded random walk: each step moves the value by a uniform amount in
//! `[-step, +step]` and clamps it into `[min, max]`. The band is narrower
//! than the pH scale so synthetic data stays near the usual operating range.

pub const SIM_MIN_PH: f64 = 6.2;
pub const SIM_MAX_PH: f64 = 7.8;
pub const SIM_STEP: f64 = 0.15;

pub struct PhSimulator {
    rng: fastrand::Rng,
    min: f64,
    max: f64,
    step: f64,
}

impl PhSimulator {
    pub fn new() -> Self {
        Self::from_rng(fastrand::Rng::new())
    }

    /// Deterministic simulator for tests.
    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(fastrand::Rng::with_seed(seed))
    }

    fn from_rng(rng: fastrand::Rng) -> Self {
        Self {
            rng,
            min: SIM_MIN_PH,
            max: SIM_MAX_PH,
            step: SIM_STEP,
        }
    }

    /// Next value of the walk, starting from `current`.
    pub fn next(&mut self, current: f64) -> f64 {
        let start = if current.is_finite() {
            current
        } else {
            (self.min + self.max) / 2.0
        };
        let delta = (self.rng.f64() * 2.0 - 1.0) * self.step;
        (start + delta).clamp(self.min, self.max)
    }
}

impl Default for PhSimulator {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
