//! Threshold evaluation: classifies a [`Reading`] into alert conditions and
//! an irrigation-demand signal.  Pure; no state is carried between cycles, so
//! a persisting condition is reported again on every cycle.

use serde::Deserialize;
use std::fmt;

use crate::sensor::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Moisture percentage at or below which the soil counts as dry.
    pub moisture_low: f32,
    /// Moisture percentage at or below which irrigation is demanded.
    pub moisture_critical: f32,
    /// Air temperature (°C) at or above which it counts as hot.
    pub temp_high: f32,
    pub temp_critical: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            moisture_low: 30.0,
            moisture_critical: 20.0,
            temp_high: 35.0,
            temp_critical: 40.0,
        }
    }
}

/// A threshold crossing, carrying the value that crossed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertCondition {
    MoistureLow(f32),
    MoistureCritical(f32),
    TemperatureHigh(f32),
    TemperatureCritical(f32),
}

impl AlertCondition {
    /// Wire name used in the `alertType` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MoistureLow(_) => "MOISTURE_LOW",
            Self::MoistureCritical(_) => "MOISTURE_CRITICAL",
            Self::TemperatureHigh(_) => "TEMPERATURE_HIGH",
            Self::TemperatureCritical(_) => "TEMPERATURE_CRITICAL",
        }
    }

    pub fn value(&self) -> f32 {
        match *self {
            Self::MoistureLow(v)
            | Self::MoistureCritical(v)
            | Self::TemperatureHigh(v)
            | Self::TemperatureCritical(v) => v,
        }
    }
}

/// Human-readable alert text for the `message` field.
impl fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MoistureLow(v) => write!(f, "Soil moisture low: {v:.1}%"),
            Self::MoistureCritical(v) => write!(f, "Soil moisture critical: {v:.1}%"),
            Self::TemperatureHigh(v) => write!(f, "Air temperature high: {v:.1}°C"),
            Self::TemperatureCritical(v) => write!(f, "Air temperature critical: {v:.1}°C"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    /// At most one entry per condition type, in declaration order.
    pub alerts: Vec<AlertCondition>,
    pub irrigation_demand: bool,
}

/// Classify `reading` against `thresholds`.
///
/// Low and critical are independent checks: a reading past the critical
/// threshold normally raises both.  Demand follows the critical moisture
/// threshold alone.
pub fn evaluate(reading: &Reading, thresholds: &Thresholds) -> Evaluation {
    let moisture = reading.soil_moisture;
    let temp = reading.air_temperature;
    let mut alerts = Vec::with_capacity(4);

    if moisture <= thresholds.moisture_low {
        alerts.push(AlertCondition::MoistureLow(moisture));
    }
    if moisture <= thresholds.moisture_critical {
        alerts.push(AlertCondition::MoistureCritical(moisture));
    }
    if temp >= thresholds.temp_high {
        alerts.push(AlertCondition::TemperatureHigh(temp));
    }
    if temp >= thresholds.temp_critical {
        alerts.push(AlertCondition::TemperatureCritical(temp));
    }

    Evaluation {
        alerts,
        irrigation_demand: moisture <= thresholds.moisture_critical,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
