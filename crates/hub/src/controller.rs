//! pH regulation controller: reading ingestion, staleness detection and the
//! pump decision engine.
//!
//! Everything in here is synchronous and clock-free: callers pass `now` in
//! milliseconds since the Unix epoch. Timers, persistence and actuation live
//! in [`crate::session`]; this module only mutates its own state and reports
//! what happened.
//!
//! ## Mode state machine
//!
//! ```text
//!           ┌──[sensor reading]──┐
//!           ▼                    │
//!         Live ──[no sensor reading for > stale_threshold]──▶ Simulated
//!           ▲                                                    │  ▲
//!           └──────────────[any sensor reading]──────────────────┘  │
//!                                                 [simulated tick]──┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crops::OptimalRange;

/// Sensor silence longer than this switches the controller to simulated data.
pub const STALE_THRESHOLD_MS: i64 = 10_000;

/// Spacing of simulated readings while in simulated mode.
pub const SIM_INTERVAL_MS: i64 = 2_000;

/// Minimum spacing between two pump events.
pub const COOLDOWN_MS: i64 = 10_000;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Sensor,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub timestamp: i64,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpType {
    /// Doses base; raises pH.
    Basic,
    /// Doses acid; lowers pH.
    Acidic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEvent {
    pub pump_type: PumpType,
    pub reagent: String,
    pub concentration: String,
    pub ph_before: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControllerState {
    pub mode: Mode,
    pub last_real_sample_at: Option<i64>,
    pub last_pump_at: Option<i64>,
    pub current_value: f64,
}

/// A mode transition produced by ingestion or a staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// Sensor went quiet; the simulator must be started.
    ToSimulated,
    /// A sensor reading arrived; the simulator must be stopped.
    ToLive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reagent {
    pub label: String,
    pub concentration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reagents {
    pub basic: Reagent,
    pub acidic: Reagent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub stale_threshold_ms: i64,
    pub cooldown_ms: i64,
}

/// What a single `ingest` call did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IngestOutcome {
    /// The reading the series now holds, or `None` if it was dropped.
    pub accepted: Option<Reading>,
    pub mode_change: Option<ModeChange>,
    pub pump: Option<PumpEvent>,
}

impl PumpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Acidic => "acidic",
        }
    }
}

impl fmt::Display for PumpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PumpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "acidic" => Ok(Self::Acidic),
            other => Err(format!("unknown pump type '{other}'")),
        }
    }
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Simulated => "simulated",
        }
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor" => Ok(Self::Sensor),
            "simulated" => Ok(Self::Simulated),
            other => Err(format!("unknown reading source '{other}'")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

impl Reagents {
    pub fn for_pump(&self, pump: PumpType) -> &Reagent {
        match pump {
            PumpType::Basic => &self.basic,
            PumpType::Acidic => &self.acidic,
        }
    }
}

impl Default for Reagents {
    fn default() -> Self {
        Self {
            basic: Reagent {
                label: "Ammonium Hydroxide (NH4OH)".into(),
                concentration: "1%".into(),
            },
            acidic: Reagent {
                label: "Acetic Acid (CH3COOH)".into(),
                concentration: "1%".into(),
            },
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            stale_threshold_ms: STALE_THRESHOLD_MS,
            cooldown_ms: COOLDOWN_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision engine
// ---------------------------------------------------------------------------

/// Pick the corrective pump for `value`, honouring the cooldown since
/// `last_pump_at`. Band edges count as in range.
pub fn decide(
    value: f64,
    range: OptimalRange,
    last_pump_at: Option<i64>,
    now: i64,
    cooldown_ms: i64,
) -> Option<PumpType> {
    if let Some(last) = last_pump_at {
        if now - last < cooldown_ms {
            return None;
        }
    }

    if value < range.min {
        Some(PumpType::Basic)
    } else if value > range.max {
        Some(PumpType::Acidic)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct PhController {
    state: ControllerState,
    series: Vec<Reading>,
    range: OptimalRange,
    reagents: Reagents,
    timing: Timing,
    /// Staleness reference until the first sensor reading arrives.
    started_at: i64,
}

impl PhController {
    pub fn new(timing: Timing, range: OptimalRange, reagents: Reagents, now: i64) -> Self {
        Self {
            state: ControllerState {
                mode: Mode::Live,
                last_real_sample_at: None,
                last_pump_at: None,
                current_value: 7.0,
            },
            series: Vec::new(),
            range,
            reagents,
            timing,
            started_at: now,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn series(&self) -> &[Reading] {
        &self.series
    }

    #[cfg(test)]
    pub fn optimal_range(&self) -> OptimalRange {
        self.range
    }

    /// Replace the target band. Takes effect on the next evaluation.
    pub fn set_optimal_range(&mut self, range: OptimalRange) {
        self.range = range;
    }

    /// Accept a reading: store it, refresh the live/simulated mode and run
    /// the decision engine on its value.
    ///
    /// Non-finite values are dropped. Simulated readings arriving while the
    /// controller is live are dropped too, so a simulator tick that races a
    /// mode switch can never write after the switch.
    pub fn ingest(&mut self, reading: Reading, now: i64) -> IngestOutcome {
        if !reading.value.is_finite() {
            tracing::debug!(value = reading.value, "dropping non-finite reading");
            return IngestOutcome::default();
        }
        if reading.source == Source::Simulated && self.state.mode == Mode::Live {
            tracing::debug!("dropping simulated reading while live");
            return IngestOutcome::default();
        }

        self.insert(reading);
        self.state.current_value = reading.value;

        let mut mode_change = None;
        if reading.source == Source::Sensor {
            self.state.last_real_sample_at = Some(
                self.state
                    .last_real_sample_at
                    .map_or(reading.timestamp, |t| t.max(reading.timestamp)),
            );
            if self.state.mode == Mode::Simulated {
                self.state.mode = Mode::Live;
                mode_change = Some(ModeChange::ToLive);
            }
        }

        let pump = self.evaluate(reading.value, now);

        IngestOutcome {
            accepted: Some(reading),
            mode_change,
            pump,
        }
    }

    /// Run the decision engine against `value`. On emission the cooldown
    /// restarts at `now`.
    pub fn evaluate(&mut self, value: f64, now: i64) -> Option<PumpEvent> {
        let pump = decide(
            value,
            self.range,
            self.state.last_pump_at,
            now,
            self.timing.cooldown_ms,
        )?;

        self.state.last_pump_at = Some(now);
        let reagent = self.reagents.for_pump(pump);

        Some(PumpEvent {
            pump_type: pump,
            reagent: reagent.label.clone(),
            concentration: reagent.concentration.clone(),
            ph_before: value,
            timestamp: now,
        })
    }

    /// Switch to simulated mode when the sensor has been silent for longer
    /// than the stale threshold. Fires at most once per outage.
    pub fn check_staleness(&mut self, now: i64) -> Option<ModeChange> {
        if self.state.mode == Mode::Simulated {
            return None;
        }

        let reference = self.state.last_real_sample_at.unwrap_or(self.started_at);
        if now - reference > self.timing.stale_threshold_ms {
            self.state.mode = Mode::Simulated;
            Some(ModeChange::ToSimulated)
        } else {
            None
        }
    }

    /// Seed the series from stored history. Restored readings never run the
    /// decision engine and never count as fresh sensor data.
    pub fn restore(&mut self, readings: &[Reading], last_pump_at: Option<i64>) {
        for r in readings.iter().filter(|r| r.value.is_finite()) {
            self.insert(*r);
        }
        if let Some(latest) = self.series.last() {
            self.state.current_value = latest.value;
        }
        if last_pump_at.is_some() {
            self.state.last_pump_at = last_pump_at;
        }
    }

    /// Drop readings older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: i64) -> usize {
        let keep_from = self.series.partition_point(|r| r.timestamp < cutoff);
        self.series.drain(..keep_from).count()
    }

    /// Readings strictly newer than `cutoff`.
    pub fn readings_since(&self, cutoff: i64) -> &[Reading] {
        let from = self.series.partition_point(|r| r.timestamp <= cutoff);
        &self.series[from..]
    }

    /// Sorted insert; an identical timestamp overwrites (last write wins).
    fn insert(&mut self, reading: Reading) {
        match self
            .series
            .binary_search_by_key(&reading.timestamp, |r| r.timestamp)
        {
            Ok(i) => self.series[i] = reading,
            Err(i) => self.series.insert(i, reading),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
