//! TOML config file loading, validation, and database seeding for the crop
//! catalog and the monitored profile.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::controller::{Reagent, Reagents, Timing, COOLDOWN_MS, SIM_INTERVAL_MS, STALE_THRESHOLD_MS};
use crate::crops::{self, Crop};
use crate::db::Db;
use crate::pump::PumpPins;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionEntry,
    #[serde(default)]
    pub controller: ControllerEntry,
    #[serde(default)]
    pub pumps: PumpEntry,
    #[serde(default)]
    pub reagents: Reagents,
    #[serde(default)]
    pub crops: Vec<CropEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SessionEntry {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub farm_location: Option<String>,
    #[serde(default)]
    pub crop: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerEntry {
    pub stale_threshold_ms: i64,
    pub sim_interval_ms: i64,
    pub cooldown_ms: i64,
    pub staleness_check_ms: i64,
    pub dose_ms: i64,
    pub retention_hours: i64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PumpEntry {
    pub basic_gpio_pin: i64,
    pub acidic_gpio_pin: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CropEntry {
    pub value: String,
    pub label: String,
    pub min_ph: f64,
    pub max_ph: f64,
}

fn default_user_id() -> String {
    "farm-1".to_string()
}

impl Default for SessionEntry {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            farm_location: None,
            crop: None,
        }
    }
}

impl Default for ControllerEntry {
    fn default() -> Self {
        Self {
            stale_threshold_ms: STALE_THRESHOLD_MS,
            sim_interval_ms: SIM_INTERVAL_MS,
            cooldown_ms: COOLDOWN_MS,
            staleness_check_ms: 1_000,
            dose_ms: 1_500,
            retention_hours: 30 * 24,
        }
    }
}

impl Default for PumpEntry {
    fn default() -> Self {
        Self {
            basic_gpio_pin: 23,
            acidic_gpio_pin: 24,
        }
    }
}

/// Runtime settings derived from a validated `[controller]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub timing: Timing,
    pub sim_interval: Duration,
    pub staleness_check: Duration,
    pub dose: Duration,
    pub retention_ms: i64,
}

impl ControllerEntry {
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            timing: Timing {
                stale_threshold_ms: self.stale_threshold_ms,
                cooldown_ms: self.cooldown_ms,
            },
            sim_interval: Duration::from_millis(self.sim_interval_ms.max(1) as u64),
            staleness_check: Duration::from_millis(self.staleness_check_ms.max(1) as u64),
            dose: Duration::from_millis(self.dose_ms.max(0) as u64),
            retention_ms: self.retention_hours * 60 * 60 * 1000,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerEntry::default().settings()
    }
}

impl PumpEntry {
    /// Only meaningful after validation has accepted both pins.
    pub(crate) fn pins(&self) -> PumpPins {
        PumpPins {
            basic: self.basic_gpio_pin as u8,
            acidic: self.acidic_gpio_pin as u8,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

const PH_SCALE: std::ops::RangeInclusive<f64> = 0.0..=14.0;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// The crop catalog: the `[[crops]]` entries, or the built-in catalog
    /// when the file declares none.
    pub fn catalog(&self) -> Vec<Crop> {
        if self.crops.is_empty() {
            return crops::default_catalog();
        }
        self.crops
            .iter()
            .map(|c| Crop {
                value: c.value.clone(),
                label: c.label.clone(),
                min_ph: c.min_ph,
                max_ph: c.max_ph,
            })
            .collect()
    }

    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_session(&mut errors);
        self.validate_controller(&mut errors);
        self.validate_pumps(&mut errors);
        self.validate_reagents(&mut errors);
        self.validate_crops(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_session(&self, errors: &mut Vec<String>) {
        if self.session.user_id.trim().is_empty() {
            errors.push("session: user_id is empty".to_string());
        }
        if let Some(crop) = &self.session.crop {
            if crops::find(&self.catalog(), crop).is_none() {
                errors.push(format!("session: crop '{crop}' is not in the crop catalog"));
            }
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        let positive = [
            ("stale_threshold_ms", c.stale_threshold_ms),
            ("sim_interval_ms", c.sim_interval_ms),
            ("cooldown_ms", c.cooldown_ms),
            ("staleness_check_ms", c.staleness_check_ms),
            ("dose_ms", c.dose_ms),
            ("retention_hours", c.retention_hours),
        ];
        for (name, value) in positive {
            if value <= 0 {
                errors.push(format!("controller: {name} must be positive, got {value}"));
            }
        }

        // A dose longer than the cooldown would let two doses overlap.
        if c.dose_ms > 0 && c.cooldown_ms > 0 && c.dose_ms > c.cooldown_ms {
            errors.push(format!(
                "controller: dose_ms ({}) exceeds cooldown_ms ({})",
                c.dose_ms, c.cooldown_ms
            ));
        }
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let p = &self.pumps;
        for (name, pin) in [("basic_gpio_pin", p.basic_gpio_pin), ("acidic_gpio_pin", p.acidic_gpio_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pumps: {name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if p.basic_gpio_pin == p.acidic_gpio_pin {
            errors.push(format!(
                "pumps: basic and acidic pumps share GPIO pin {}",
                p.basic_gpio_pin
            ));
        }
    }

    fn validate_reagents(&self, errors: &mut Vec<String>) {
        let check = |name: &str, r: &Reagent, errors: &mut Vec<String>| {
            if r.label.trim().is_empty() {
                errors.push(format!("reagents.{name}: label is empty"));
            }
            if r.concentration.trim().is_empty() {
                errors.push(format!("reagents.{name}: concentration is empty"));
            }
        };
        check("basic", &self.reagents.basic, errors);
        check("acidic", &self.reagents.acidic, errors);
    }

    fn validate_crops(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, c) in self.crops.iter().enumerate() {
            let ctx = || {
                if c.value.is_empty() {
                    format!("crops[{i}]")
                } else {
                    format!("crop '{}'", c.value)
                }
            };

            if c.value.trim().is_empty() {
                errors.push(format!("{}: value is empty", ctx()));
            } else if !seen.insert(&c.value) {
                errors.push(format!("{}: duplicate value", ctx()));
            }
            if c.label.trim().is_empty() {
                errors.push(format!("{}: label is empty", ctx()));
            }

            for (name, v) in [("min_ph", c.min_ph), ("max_ph", c.max_ph)] {
                if !PH_SCALE.contains(&v) {
                    errors.push(format!("{}: {name} {v} out of range [0, 14]", ctx()));
                }
            }
            if c.min_ph >= c.max_ph {
                errors.push(format!(
                    "{}: max_ph ({}) must be greater than min_ph ({})",
                    ctx(),
                    c.max_ph,
                    c.min_ph
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Make the stored crop catalog match the config and upsert the session
/// profile. Crops dropped from the config are deleted.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let catalog = config.catalog();
    for (i, crop) in catalog.iter().enumerate() {
        db.upsert_crop(crop, i as i64)
            .await
            .with_context(|| format!("failed to upsert crop '{}'", crop.value))?;
    }
    let keep: Vec<String> = catalog.iter().map(|c| c.value.clone()).collect();
    let removed = db.retain_crops(&keep).await?;
    if removed > 0 {
        tracing::info!(removed, "removed crops no longer in config");
    }

    let s = &config.session;
    db.upsert_profile(&s.user_id, s.farm_location.as_deref())
        .await
        .with_context(|| format!("failed to upsert profile '{}'", s.user_id))?;

    tracing::info!(
        crops = catalog.len(),
        user = %s.user_id,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
