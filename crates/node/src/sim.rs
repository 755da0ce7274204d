//! Stateful pH probe simulator for local development.
//!
//! Models a probe sitting in a nutrient tank:
//! - Temporal coherence via random walk with mean reversion
//! - Slow chemical drift (acidifying or alkaline scenarios)
//! - Per-reading electronic noise
//! - Occasional spikes (probe flakiness)
//! - Silent stretches where the probe stops reporting (dropout scenario)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Hovers around 7.0 with low noise. Should never trigger a pump.
    Stable,
    /// Drifts slowly downward. Exercises the basic (pH-raising) pump.
    Acidifying,
    /// Drifts slowly upward. Exercises the acidic (pH-lowering) pump.
    Alkaline,
    /// High noise and ~10% spikes. Exercises the hub's cooldown.
    Flaky,
    /// Stable values with periodic silences longer than the hub's
    /// staleness threshold, so the hub falls back to simulated data.
    Dropout,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "acidifying" => Self::Acidifying,
            "alkaline" => Self::Alkaline,
            "flaky" => Self::Flaky,
            "dropout" => Self::Dropout,
            _ => Self::Stable,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::Acidifying => "acidifying",
            Self::Alkaline => "alkaline",
            Self::Flaky => "flaky",
            Self::Dropout => "dropout",
        };
        f.write_str(name)
    }
}

/// Samples reported between two silences in the dropout scenario.
pub const DROPOUT_ON_SAMPLES: u32 = 20;
/// Samples swallowed per silence. At the default 2 s sample period this is
/// 16 s of silence, past the hub's 10 s threshold.
pub const DROPOUT_OFF_SAMPLES: u32 = 8;

const CENTER_PH: f64 = 7.0;
const MIN_BASE: f64 = 3.0;
const MAX_BASE: f64 = 11.0;

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct PhProbeSim {
    rng: fastrand::Rng,
    scenario: Scenario,
    /// Current "true" tank pH. Evolves each tick.
    base: f64,
    /// Permanent calibration error of this probe.
    offset: f64,

    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f64,
    spike_sigma: f64,

    tick: u32,
}

impl PhProbeSim {
    pub fn new(scenario: Scenario) -> Self {
        Self::with_rng(scenario, fastrand::Rng::new())
    }

    /// Deterministic simulator for tests.
    #[cfg(test)]
    pub fn with_seed(scenario: Scenario, seed: u64) -> Self {
        Self::with_rng(scenario, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(scenario: Scenario, mut rng: fastrand::Rng) -> Self {
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma) = match scenario {
            Scenario::Stable | Scenario::Dropout => (0.0, 0.01, 0.10, 0.01, 0.005, 0.3),
            Scenario::Acidifying => (-0.01, 0.01, 0.0, 0.02, 0.01, 0.3),
            Scenario::Alkaline => (0.01, 0.01, 0.0, 0.02, 0.01, 0.3),
            Scenario::Flaky => (0.0, 0.03, 0.05, 0.08, 0.10, 0.8),
        };
        let offset = gaussian(&mut rng, 0.0, 0.03);

        Self {
            rng,
            scenario,
            base: CENTER_PH,
            offset,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            noise_sigma,
            spike_prob,
            spike_sigma,
            tick: 0,
        }
    }

    /// Produce the next pH reading, or `None` while the probe is silent.
    ///
    /// The tank keeps evolving during silences, so the first reading after
    /// one reflects the elapsed drift.
    pub fn sample(&mut self) -> Option<f64> {
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);

        let pull = self.mean_reversion * (CENTER_PH - self.base);
        let walk = gaussian(&mut self.rng, 0.0, self.walk_sigma);
        self.base = (self.base + self.drift_per_sample + pull + walk).clamp(MIN_BASE, MAX_BASE);

        if self.scenario == Scenario::Dropout
            && tick % (DROPOUT_ON_SAMPLES + DROPOUT_OFF_SAMPLES) >= DROPOUT_ON_SAMPLES
        {
            return None;
        }

        let noise = gaussian(&mut self.rng, 0.0, self.noise_sigma);
        let spike = if self.rng.f64() < self.spike_prob {
            gaussian(&mut self.rng, 0.0, self.spike_sigma)
        } else {
            0.0
        };

        let reading = (self.base + self.offset + noise + spike).clamp(0.0, 14.0);
        Some((reading * 100.0).round() / 100.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
