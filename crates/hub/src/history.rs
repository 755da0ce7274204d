//! Time windows over the reading series and summary statistics.

use serde::{Deserialize, Serialize};

use crate::controller::{PumpEvent, PumpType, Reading};

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeRange {
    #[default]
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PhStats {
    pub count: usize,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub basic_pumps: usize,
    pub acidic_pumps: usize,
}

impl TimeRange {
    /// Unknown strings fall back to the last 24 hours.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "7d" => Self::Week,
            "30d" => Self::Month,
            _ => Self::Day,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::Day => 24 * HOUR_MS,
            Self::Week => 7 * 24 * HOUR_MS,
            Self::Month => 30 * 24 * HOUR_MS,
        }
    }

    /// Readings must be strictly newer than this to fall in the window.
    pub fn cutoff(&self, now: i64) -> i64 {
        now - self.duration_ms()
    }
}

pub fn summarize(readings: &[Reading], pumps: &[PumpEvent]) -> PhStats {
    let count = readings.len();
    let (avg, min, max) = if count == 0 {
        (None, None, None)
    } else {
        let sum: f64 = readings.iter().map(|r| r.value).sum();
        let min = readings.iter().map(|r| r.value).fold(f64::INFINITY, f64::min);
        let max = readings
            .iter()
            .map(|r| r.value)
            .fold(f64::NEG_INFINITY, f64::max);
        (Some(sum / count as f64), Some(min), Some(max))
    };

    PhStats {
        count,
        avg,
        min,
        max,
        basic_pumps: pumps.iter().filter(|p| p.pump_type == PumpType::Basic).count(),
        acidic_pumps: pumps.iter().filter(|p| p.pump_type == PumpType::Acidic).count(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Source;

    fn reading(value: f64) -> Reading {
        Reading {
            value,
            timestamp: 0,
            source: Source::Sensor,
        }
    }

    fn pump(pump_type: PumpType) -> PumpEvent {
        PumpEvent {
            pump_type,
            reagent: "r".into(),
            concentration: "1%".into(),
            ph_before: 7.0,
            timestamp: 0,
        }
    }

    #[test]
    fn time_range_parsing() {
        assert_eq!(TimeRange::from_str_lossy("24h"), TimeRange::Day);
        assert_eq!(TimeRange::from_str_lossy("7D"), TimeRange::Week);
        assert_eq!(TimeRange::from_str_lossy("30d"), TimeRange::Month);
        assert_eq!(TimeRange::from_str_lossy("1y"), TimeRange::Day);
    }

    #[test]
    fn time_range_cutoff() {
        assert_eq!(TimeRange::Day.cutoff(100_000_000), 100_000_000 - 86_400_000);
        assert_eq!(TimeRange::Week.duration_ms(), 604_800_000);
    }

    #[test]
    fn summarize_empty() {
        let stats = summarize(&[], &[]);
        assert_eq!(stats, PhStats::default());
    }

    #[test]
    fn summarize_values_and_pumps() {
        let stats = summarize(
            &[reading(6.0), reading(7.0), reading(8.0)],
            &[pump(PumpType::Basic), pump(PumpType::Acidic), pump(PumpType::Basic)],
        );
        assert_eq!(stats.count, 3);
        assert!((stats.avg.unwrap() - 7.0).abs() < 1e-12);
        assert_eq!(stats.min, Some(6.0));
        assert_eq!(stats.max, Some(8.0));
        assert_eq!(stats.basic_pumps, 2);
        assert_eq!(stats.acidic_pumps, 1);
    }
}
