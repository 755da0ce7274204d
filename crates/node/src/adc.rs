//! pH probe behind an ADS1115 16-bit ADC over I2C.
//!
//! Reads one single-ended channel at PGA ±4.096 V, 128 SPS, single-shot
//! mode, converts the result to volts and maps volts to pH with a two-point
//! calibration (buffer solutions at pH 7 and pH 4). The conversion math is
//! always compiled; the I2C driver needs the `adc` feature.

#![cfg_attr(not(feature = "adc"), allow(dead_code))]

use anyhow::{ensure, Context, Result};

// ── ADS1115 register addresses ──────────────────────────────────────────────

#[cfg(feature = "adc")]
const REG_CONVERSION: u8 = 0x00;
#[cfg(feature = "adc")]
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       start single-shot conversion (write) / ready (read)
//   [14:12] MUX      input multiplexer
//   [11:9]  PGA      programmable gain amplifier
//   [8]     MODE     0 = continuous, 1 = single-shot
//   [7:5]   DR       data rate
//   [4:0]   comparator, disabled (COMP_QUE = 11)

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), comparator off.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
/// AINx vs GND for x = 0..=3.
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
const MAX_CHANNEL: usize = 3;

/// Full-scale voltage of the ±4.096 V range.
const FULL_SCALE_V: f64 = 4.096;
const FULL_SCALE_COUNTS: f64 = 32_768.0;

#[cfg(feature = "adc")]
const CONVERSION_WAIT: std::time::Duration = std::time::Duration::from_millis(9);
#[cfg(feature = "adc")]
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Raw single-ended conversion result to volts.
pub fn raw_to_volts(raw: i16) -> f64 {
    f64::from(raw.max(0)) * FULL_SCALE_V / FULL_SCALE_COUNTS
}

// ── Calibration ─────────────────────────────────────────────────────────────

/// Probe output voltage measured in pH 7 and pH 4 buffer solutions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub v7: f64,
    pub v4: f64,
}

impl Default for Calibration {
    /// Typical PH-4502C style amplifier board on 5 V: output rises as the
    /// solution gets more acidic.
    fn default() -> Self {
        Self { v7: 2.50, v4: 3.05 }
    }
}

impl Calibration {
    pub fn new(v7: f64, v4: f64) -> Result<Self> {
        ensure!(
            v7.is_finite() && v4.is_finite(),
            "calibration voltages must be finite (v7={v7}, v4={v4})"
        );
        ensure!(
            (v7 - v4).abs() > 1e-3,
            "calibration voltages for pH 7 and pH 4 must differ (both {v7})"
        );
        Ok(Self { v7, v4 })
    }

    /// Build from `PH_CAL_V7` / `PH_CAL_V4` values; empty means default.
    pub fn parse(v7: &str, v4: &str) -> Result<Self> {
        let defaults = Self::default();
        let parse = |name: &str, s: &str, default: f64| -> Result<f64> {
            if s.trim().is_empty() {
                return Ok(default);
            }
            s.trim()
                .parse()
                .with_context(|| format!("invalid {name}: {s:?}"))
        };
        Self::new(
            parse("PH_CAL_V7", v7, defaults.v7)?,
            parse("PH_CAL_V4", v4, defaults.v4)?,
        )
    }

    /// pH units per volt.
    pub fn slope(&self) -> f64 {
        (7.0 - 4.0) / (self.v7 - self.v4)
    }

    /// Linear map through both calibration points, clamped to the pH scale.
    pub fn volts_to_ph(&self, volts: f64) -> f64 {
        (7.0 + (volts - self.v7) * self.slope()).clamp(0.0, 14.0)
    }
}

/// Parse the `PH_CHANNEL` value; empty means AIN0.
pub fn parse_channel(env_val: &str) -> Result<usize> {
    if env_val.trim().is_empty() {
        return Ok(0);
    }
    let ch: usize = env_val
        .trim()
        .parse()
        .with_context(|| format!("invalid PH_CHANNEL: {env_val:?}"))?;
    ensure!(ch <= MAX_CHANNEL, "PH_CHANNEL {ch} exceeds maximum ({MAX_CHANNEL})");
    Ok(ch)
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "adc")]
pub struct PhProbe {
    i2c: rppal::i2c::I2c,
    channel: usize,
    calibration: Calibration,
}

#[cfg(feature = "adc")]
impl PhProbe {
    /// Open I2C bus 1 with the ADS1115 at `addr`.
    pub fn new(addr: u16, channel: usize, calibration: Calibration) -> Result<Self> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0-{MAX_CHANNEL})"
        );

        let mut i2c = rppal::i2c::I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            channel,
            v7 = calibration.v7,
            v4 = calibration.v4,
            "ads1115 ph probe initialised"
        );

        Ok(Self {
            i2c,
            channel,
            calibration,
        })
    }

    /// Probe on the default address (0x48) configured from the environment.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        let channel = parse_channel(&var("PH_CHANNEL"))?;
        let calibration = Calibration::parse(&var("PH_CAL_V7"), &var("PH_CAL_V4"))?;
        Self::new(0x48, channel, calibration)
    }

    fn read_raw(&mut self) -> Result<i16> {
        let config = config_for_channel(self.channel);
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

        std::thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }

    /// One pH reading rounded to hundredths. Bus errors are logged and
    /// yield `None` (the hub treats a silent probe as stale).
    pub fn sample(&mut self) -> Option<f64> {
        match self.read_raw() {
            Ok(raw) => {
                let volts = raw_to_volts(raw);
                let ph = self.calibration.volts_to_ph(volts);
                tracing::debug!(raw, volts, ph, "adc sample");
                Some((ph * 100.0).round() / 100.0)
            }
            Err(e) => {
                tracing::error!(channel = self.channel, "adc read failed: {e}");
                None
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
