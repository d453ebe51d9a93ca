//! Simulated sensor hardware for bench runs without a probe, DHT or light
//! sensor attached.
//!
//! - Soil wetness follows a random walk with mean reversion and a slow drying
//!   drift, and rises while the pump runs (closed loop).
//! - The probe adds ADC noise and occasional spikes on top of the
//!   calibration mapping, in whichever direction the wiring runs.
//! - Temperature, humidity and light follow a day/night cycle.
//! - Flaky hardware drops air readings (NaN) and reports light bus errors.

use std::fmt;

use crate::config::{Calibration, ADC_MAX};
use crate::sensor::{AirSample, SensorHardware};

/// Approximate a sample from N(0,1): sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `[sim] scenario` or `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries toward the critical threshold.
    Drying,
    /// Hovers near the middle, low noise, no faults.
    Stable,
    /// Noisy probe, frequent spikes, dropped air readings and light errors.
    Flaky,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

/// Per-scenario tuning.  Wetness quantities are fractions of the full
/// dry-to-wet span.
struct Profile {
    start_wetness: f64,
    drying_per_sample: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    spike_prob: f64,
    spike_sigma: f64,
    air_dropout_prob: f64,
    light_error_prob: f64,
}

impl Profile {
    fn for_scenario(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Drying => Self {
                start_wetness: 0.5,
                drying_per_sample: 0.02,
                walk_sigma: 0.01,
                noise_sigma: 0.005,
                spike_prob: 0.03,
                spike_sigma: 0.15,
                air_dropout_prob: 0.01,
                light_error_prob: 0.0,
            },
            Scenario::Stable => Self {
                start_wetness: 0.5,
                drying_per_sample: 0.002,
                walk_sigma: 0.004,
                noise_sigma: 0.002,
                spike_prob: 0.0,
                spike_sigma: 0.0,
                air_dropout_prob: 0.0,
                light_error_prob: 0.0,
            },
            Scenario::Flaky => Self {
                start_wetness: 0.5,
                drying_per_sample: 0.01,
                walk_sigma: 0.02,
                noise_sigma: 0.02,
                spike_prob: 0.10,
                spike_sigma: 0.25,
                air_dropout_prob: 0.08,
                light_error_prob: 0.05,
            },
            Scenario::Wet => Self {
                start_wetness: 0.9,
                drying_per_sample: 0.003,
                walk_sigma: 0.005,
                noise_sigma: 0.004,
                spike_prob: 0.01,
                spike_sigma: 0.1,
                air_dropout_prob: 0.0,
                light_error_prob: 0.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SimSensors {
    profile: Profile,
    calibration: Calibration,
    /// True soil wetness, 0.0 = dry endpoint, 1.0 = wet endpoint.
    wetness: f64,
    /// Pump ticks observed since the last moisture sample.
    pump_ticks: u32,
    diurnal_period_s: f64,
}

/// Wetness gained per tick (~1 s) of pumping.
const WET_PER_PUMP_TICK: f64 = 0.01;
/// Pull toward mid-range per sample.
const MEAN_REVERSION: f64 = 0.02;
/// Code returned by a BH1750 on a failed bus transaction.
const LIGHT_BUS_ERROR: f32 = -2.0;

impl SimSensors {
    /// `diurnal_period_s` is the day/night cycle length.  Use 600 (10 min)
    /// for fast bench iteration or 86400 for real time.
    pub fn new(scenario: Scenario, calibration: Calibration, diurnal_period_s: f64) -> Self {
        let profile = Profile::for_scenario(scenario);
        let wetness = (profile.start_wetness + gaussian(0.0, 0.03)).clamp(0.0, 1.0);
        tracing::info!(%scenario, wetness = format!("{wetness:.2}"), "sensor simulator ready");
        Self {
            profile,
            calibration,
            wetness,
            pump_ticks: 0,
            diurnal_period_s,
        }
    }

    /// Day phase in [-1, 1]: peaks mid-"afternoon".
    fn daylight(&self) -> f64 {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        (2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s).sin()
    }

    fn chance(p: f64) -> bool {
        p > 0.0 && fastrand::f64() < p
    }
}

impl SensorHardware for SimSensors {
    fn read_moisture_raw(&mut self) -> i32 {
        let p = &self.profile;

        let pull = MEAN_REVERSION * (0.5 - self.wetness);
        let watered = self.pump_ticks as f64 * WET_PER_PUMP_TICK;
        self.pump_ticks = 0;
        self.wetness = (self.wetness - p.drying_per_sample
            + pull
            + gaussian(0.0, p.walk_sigma)
            + watered)
            .clamp(0.0, 1.0);

        let mut observed = self.wetness + gaussian(0.0, p.noise_sigma);
        if Self::chance(p.spike_prob) {
            observed += gaussian(0.0, p.spike_sigma);
        }

        let dry = self.calibration.moisture_raw_dry as f64;
        let wet = self.calibration.moisture_raw_wet as f64;
        let raw = dry + observed * (wet - dry);
        raw.round().clamp(0.0, ADC_MAX as f64) as i32
    }

    fn read_air(&mut self) -> AirSample {
        if Self::chance(self.profile.air_dropout_prob) {
            return AirSample {
                temperature: f32::NAN,
                humidity: f32::NAN,
            };
        }
        let day = self.daylight();
        let temperature = 26.0 + 7.0 * day + gaussian(0.0, 0.3);
        let humidity = (60.0 - 15.0 * day + gaussian(0.0, 1.0)).clamp(0.0, 100.0);
        AirSample {
            temperature: temperature as f32,
            humidity: humidity as f32,
        }
    }

    fn read_light(&mut self) -> f32 {
        if Self::chance(self.profile.light_error_prob) {
            return LIGHT_BUS_ERROR;
        }
        let lux = 20_000.0 * self.daylight().max(0.0) + gaussian(5.0, 2.0).abs();
        lux as f32
    }

    fn observe_pump(&mut self, running: bool) {
        if running {
            self.pump_ticks += 1;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
