//! Pump relay output. The `gpio` feature gates the real rppal driver;
//! without it, a mock relay records the state and logs changes.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// A single digital output driving the pump relay.
pub trait Relay {
    fn set(&mut self, energized: bool);
    fn is_energized(&self) -> bool;
}

fn label(energized: bool) -> &'static str {
    if energized {
        "ENERGIZED"
    } else {
        "released"
    }
}

// ---------------------------------------------------------------------------
// GPIO relay (rppal, Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioRelay {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    energized: bool,
}

#[cfg(feature = "gpio")]
impl GpioRelay {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(pin_num)?.into_output();
        let mut relay = Self {
            pin,
            active_low,
            energized: true,
        };
        // Fail-safe: ensure released at startup
        relay.set(false);
        tracing::info!(gpio = pin_num, active_low, "relay initialised");
        Ok(relay)
    }
}

#[cfg(feature = "gpio")]
impl Relay for GpioRelay {
    fn set(&mut self, energized: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if energized != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        self.energized = energized;
        tracing::debug!(state = label(energized), "relay set");
    }

    fn is_energized(&self) -> bool {
        self.energized
    }
}

// ---------------------------------------------------------------------------
// Mock relay (no hardware)
// ---------------------------------------------------------------------------
#[cfg_attr(feature = "gpio", allow(dead_code))]
#[derive(Debug, Default)]
pub struct MockRelay {
    energized: bool,
    /// Number of output writes, for tests.
    #[cfg(test)]
    pub(crate) writes: usize,
}

#[cfg_attr(feature = "gpio", allow(dead_code))]
impl MockRelay {
    pub fn new(pin_num: u8) -> Result<Self> {
        tracing::info!(gpio = pin_num, "[mock-gpio] relay registered (not wired)");
        Ok(Self::default())
    }
}

impl Relay for MockRelay {
    fn set(&mut self, energized: bool) {
        self.energized = energized;
        #[cfg(test)]
        {
            self.writes += 1;
        }
        tracing::debug!(state = label(energized), "[mock-gpio] relay set");
    }

    fn is_energized(&self) -> bool {
        self.energized
    }
}

/// Open the relay output for the current build.
#[cfg(feature = "gpio")]
pub fn open(pin_num: u8, active_low: bool) -> Result<GpioRelay> {
    GpioRelay::new(pin_num, active_low)
}

#[cfg(not(feature = "gpio"))]
pub fn open(pin_num: u8, _active_low: bool) -> Result<MockRelay> {
    MockRelay::new(pin_num)
}

// ===========================================================================
// Tests
// ===========================================================================
