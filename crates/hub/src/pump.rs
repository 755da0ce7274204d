//! Dosing pump relays. The `gpio` feature gates the real rppal driver;
//! without it, a mock board logs state changes.

use anyhow::Result;
use std::collections::HashMap;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::controller::PumpType;

/// Relay wiring for the two dosing pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PumpPins {
    pub(crate) basic: u8,
    pub(crate) acidic: u8,
}

// ---------------------------------------------------------------------------
// Real GPIO pump board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct PumpBoard {
    pins: HashMap<PumpType, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl PumpBoard {
    pub(crate) fn new(wiring: PumpPins, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (pump, pin_num) in [(PumpType::Basic, wiring.basic), (PumpType::Acidic, wiring.acidic)] {
            let mut pin = gpio.get(pin_num)?.into_output();

            // Fail-safe: pumps OFF at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(pump, pin);
        }

        Ok(Self { pins, active_low })
    }

    pub(crate) fn set(&mut self, pump: PumpType, on: bool) {
        if let Some(pin) = self.pins.get_mut(&pump) {
            // active-low relay: LOW = ON, HIGH = OFF
            if on != self.active_low {
                pin.set_high()
            } else {
                pin.set_low()
            }
            tracing::info!(%pump, on, "pump relay set");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_on(&self, pump: PumpType) -> bool {
        self.pins
            .get(&pump)
            .map(|pin| pin.is_set_high() != self.active_low)
            .unwrap_or(false)
    }

    pub(crate) fn all_off(&mut self) {
        for pump in [PumpType::Basic, PumpType::Acidic] {
            self.set(pump, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock pump board (no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct PumpBoard {
    pub(super) pumps: HashMap<PumpType, bool>,
}

#[cfg(not(feature = "gpio"))]
impl PumpBoard {
    pub(crate) fn new(wiring: PumpPins, _active_low: bool) -> Result<Self> {
        tracing::info!(
            basic_gpio = wiring.basic,
            acidic_gpio = wiring.acidic,
            "[mock-gpio] pump board initialised (no hardware)"
        );
        let pumps = [(PumpType::Basic, false), (PumpType::Acidic, false)]
            .into_iter()
            .collect();
        Ok(Self { pumps })
    }

    pub(crate) fn set(&mut self, pump: PumpType, on: bool) {
        if let Some(state) = self.pumps.get_mut(&pump) {
            *state = on;
            tracing::info!(%pump, on, "[mock-gpio] pump relay set");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_on(&self, pump: PumpType) -> bool {
        self.pumps.get(&pump).copied().unwrap_or(false)
    }

    pub(crate) fn all_off(&mut self) {
        for pump in [PumpType::Basic, PumpType::Acidic] {
            self.set(pump, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
