//! Sensor acquisition: turns raw hardware measurements into a validated
//! [`Reading`].  Acquisition never fails; faulty measurements are replaced by
//! safe defaults and out-of-range moisture is clamped.

use crate::config::Calibration;

// ---------------------------------------------------------------------------
// Hardware boundary
// ---------------------------------------------------------------------------

/// One temperature/humidity measurement.  Either field may be NaN when the
/// sensor misses its timing window.
#[derive(Debug, Clone, Copy)]
pub struct AirSample {
    pub temperature: f32,
    pub humidity: f32,
}

/// The three sensor sources the node samples each cycle.
pub trait SensorHardware {
    /// Raw analog value from the soil probe.
    fn read_moisture_raw(&mut self) -> i32;

    /// Air temperature (°C) and relative humidity (%).
    fn read_air(&mut self) -> AirSample;

    /// Illuminance in lux.  NaN or negative on a bus error.
    fn read_light(&mut self) -> f32;

    /// Told after every cycle whether the pump is running.  Real hardware
    /// ignores it; the simulator uses it to wet the soil.
    fn observe_pump(&mut self, _running: bool) {}
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// One validated snapshot of all sensor values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Percent, always within 0..=100.
    pub soil_moisture: f32,
    pub air_temperature: f32,
    pub air_humidity: f32,
    pub light_intensity: f32,
}

/// Map a raw probe value to a moisture percentage using the dry (0 %) and
/// wet (100 %) endpoints.  Works for either wiring direction; the result is
/// clamped so readings past an endpoint saturate instead of going negative.
pub fn moisture_percent(raw: i32, cal: &Calibration) -> f32 {
    let dry = f64::from(cal.moisture_raw_dry);
    let range = f64::from(cal.moisture_raw_wet) - dry;
    if range == 0.0 {
        return 0.0; // zero-width calibration
    }
    let pct = (f64::from(raw) - dry) * 100.0 / range;
    pct.clamp(0.0, 100.0) as f32
}

/// Replace a missing measurement with `0.0`.
fn or_zero(value: f32, what: &str) -> f32 {
    if value.is_nan() {
        tracing::warn!(sensor = what, "invalid measurement, substituting 0");
        0.0
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

pub struct Acquisition<H> {
    hardware: H,
    calibration: Calibration,
}

impl<H: SensorHardware> Acquisition<H> {
    pub fn new(hardware: H, calibration: Calibration) -> Self {
        Self {
            hardware,
            calibration,
        }
    }

    /// Sample every source once and build a fully-defined [`Reading`].
    pub fn acquire(&mut self) -> Reading {
        let raw = self.hardware.read_moisture_raw();
        let air = self.hardware.read_air();
        let lux = self.hardware.read_light();

        let light_intensity = if lux < 0.0 {
            tracing::warn!(sensor = "light", lux, "light sensor error, substituting 0");
            0.0
        } else {
            or_zero(lux, "light")
        };

        let reading = Reading {
            soil_moisture: moisture_percent(raw, &self.calibration),
            air_temperature: or_zero(air.temperature, "temperature"),
            air_humidity: or_zero(air.humidity, "humidity"),
            light_intensity,
        };

        tracing::debug!(raw, ?reading, "sensors sampled");
        reading
    }

    pub fn observe_pump(&mut self, running: bool) {
        self.hardware.observe_pump(running);
    }

    #[cfg(test)]
    pub(crate) fn hardware(&self) -> &H {
        &self.hardware
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Hardware stub returning fixed values.
    pub(crate) struct FixedHardware {
        pub(crate) raw: i32,
        pub(crate) air: AirSample,
        pub(crate) lux: f32,
        pub(crate) pump_seen: Option<bool>,
    }

    impl FixedHardware {
        pub(crate) fn new(raw: i32) -> Self {
            Self {
                raw,
                air: AirSample {
                    temperature: 24.5,
                    humidity: 55.0,
                },
                lux: 800.0,
                pump_seen: None,
            }
        }
    }

    impl SensorHardware for FixedHardware {
        fn read_moisture_raw(&mut self) -> i32 {
            self.raw
        }
        fn read_air(&mut self) -> AirSample {
            self.air
        }
        fn read_light(&mut self) -> f32 {
            self.lux
        }
        fn observe_pump(&mut self, running: bool) {
            self.pump_seen = Some(running);
        }
    }

    fn capacitive() -> Calibration {
        Calibration {
            moisture_raw_dry: 3500,
            moisture_raw_wet: 1500,
        }
    }

    // -- moisture_percent ---------------------------------------------------

    #[test]
    fn wet_endpoint_is_full() {
        assert_eq!(moisture_percent(1500, &capacitive()), 100.0);
    }

    #[test]
    fn dry_endpoint_is_zero() {
        assert_eq!(moisture_percent(3500, &capacitive()), 0.0);
    }

    #[test]
    fn midpoint_is_half() {
        assert!((moisture_percent(2500, &capacitive()) - 50.0).abs() < 1e-4);
    }

    #[test]
    fn beyond_endpoints_clamped() {
        assert_eq!(moisture_percent(4095, &capacitive()), 0.0);
        assert_eq!(moisture_percent(0, &capacitive()), 100.0);
        assert_eq!(moisture_percent(-20, &capacitive()), 100.0);
    }

    #[test]
    fn resistive_wiring_inverts_direction() {
        let resistive = Calibration {
            moisture_raw_dry: 1000,
            moisture_raw_wet: 3000,
        };
        assert_eq!(moisture_percent(1000, &resistive), 0.0);
        assert_eq!(moisture_percent(3000, &resistive), 100.0);
        assert!((moisture_percent(1500, &resistive) - 25.0).abs() < 1e-4);
    }

    #[test]
    fn degenerate_calibration_reads_zero() {
        let flat = Calibration {
            moisture_raw_dry: 2000,
            moisture_raw_wet: 2000,
        };
        assert_eq!(moisture_percent(2000, &flat), 0.0);
    }

    #[test]
    fn every_raw_value_within_bounds() {
        let extremes = [i32::MIN, i32::MIN + 1, -1, i32::MAX - 1, i32::MAX];
        for raw in (-500..5000).step_by(7).chain(extremes) {
            let m = moisture_percent(raw, &capacitive());
            assert!((0.0..=100.0).contains(&m), "raw {raw} -> {m}");
        }
        assert_eq!(moisture_percent(i32::MIN, &capacitive()), 100.0);
        assert_eq!(moisture_percent(i32::MAX, &capacitive()), 0.0);
    }

    // -- acquire ------------------------------------------------------------

    #[test]
    fn acquire_passes_valid_values_through() {
        let mut acq = Acquisition::new(FixedHardware::new(1500), capacitive());
        let r = acq.acquire();
        assert_eq!(r.soil_moisture, 100.0);
        assert_eq!(r.air_temperature, 24.5);
        assert_eq!(r.air_humidity, 55.0);
        assert_eq!(r.light_intensity, 800.0);
    }

    #[test]
    fn acquire_substitutes_nan_air_values() {
        let mut hw = FixedHardware::new(2500);
        hw.air = AirSample {
            temperature: f32::NAN,
            humidity: f32::NAN,
        };
        let mut acq = Acquisition::new(hw, capacitive());
        let r = acq.acquire();
        assert_eq!(r.air_temperature, 0.0);
        assert_eq!(r.air_humidity, 0.0);
    }

    #[test]
    fn acquire_substitutes_light_errors() {
        let mut hw = FixedHardware::new(2500);
        hw.lux = -2.0;
        let mut acq = Acquisition::new(hw, capacitive());
        assert_eq!(acq.acquire().light_intensity, 0.0);

        let mut hw = FixedHardware::new(2500);
        hw.lux = f32::NAN;
        let mut acq = Acquisition::new(hw, capacitive());
        assert_eq!(acq.acquire().light_intensity, 0.0);
    }

    #[test]
    fn acquire_forwards_pump_state() {
        let mut acq = Acquisition::new(FixedHardware::new(2500), capacitive());
        acq.observe_pump(true);
        assert_eq!(acq.hardware().pump_seen, Some(true));
    }
}
