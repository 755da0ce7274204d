//! Crop catalog and the optimal pH band attached to the selected crop.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crop {
    pub value: String,
    pub label: String,
    pub min_ph: f64,
    pub max_ph: f64,
}

/// Acceptable pH band. Both ends are inclusive: a value equal to `min` or
/// `max` is in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimalRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhStatus {
    TooAcidic,
    Optimal,
    TooBasic,
}

impl Crop {
    pub fn optimal_range(&self) -> OptimalRange {
        OptimalRange {
            min: self.min_ph,
            max: self.max_ph,
        }
    }

    pub fn midpoint_ph(&self) -> f64 {
        (self.min_ph + self.max_ph) / 2.0
    }
}

impl OptimalRange {
    /// Band used until a crop is selected.
    pub const DEFAULT: OptimalRange = OptimalRange { min: 6.5, max: 7.5 };

    pub fn classify(&self, value: f64) -> PhStatus {
        if value < self.min {
            PhStatus::TooAcidic
        } else if value > self.max {
            PhStatus::TooBasic
        } else {
            PhStatus::Optimal
        }
    }
}

impl Default for OptimalRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for OptimalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.min, self.max)
    }
}

impl fmt::Display for PhStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooAcidic => write!(f, "too acidic"),
            Self::Optimal => write!(f, "optimal"),
            Self::TooBasic => write!(f, "too basic"),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in catalog
// ---------------------------------------------------------------------------

const BUILTIN: &[(&str, &str, f64, f64)] = &[
    // Cereals
    ("rice", "Rice (Dhaan)", 5.5, 6.5),
    ("wheat", "Wheat (Gehun)", 6.0, 7.5),
    ("maize", "Maize/Corn", 5.5, 7.5),
    // Pulses
    ("chickpea", "Chickpea (Chana)", 6.0, 7.5),
    ("pigeon_pea", "Pigeon Pea (Arhar)", 5.5, 7.0),
    // Vegetables
    ("tomato", "Tomato", 5.5, 6.8),
    ("potato", "Potato", 5.0, 6.0),
    ("onion", "Onion", 6.0, 7.0),
    ("cabbage", "Cabbage", 6.0, 7.5),
    ("carrot", "Carrot", 6.0, 7.0),
    // Fruits
    ("mango", "Mango", 5.5, 7.5),
    ("banana", "Banana", 5.5, 7.0),
    ("apple", "Apple", 5.5, 6.5),
    // Cash crops
    ("cotton", "Cotton", 5.5, 7.5),
    ("sugarcane", "Sugarcane", 6.0, 7.5),
];

/// The catalog used when the config file declares no `[[crops]]`.
pub fn default_catalog() -> Vec<Crop> {
    BUILTIN
        .iter()
        .map(|&(value, label, min_ph, max_ph)| Crop {
            value: value.to_string(),
            label: label.to_string(),
            min_ph,
            max_ph,
        })
        .collect()
}

pub fn find<'a>(catalog: &'a [Crop], value: &str) -> Option<&'a Crop> {
    catalog.iter().find(|c| c.value == value)
}

// ===========================================================================
// Tests
// ===========================================================================
