//! TOML config file loading, environment overrides, and validation for the
//! node: broker, identity, relay wiring, thresholds, timing, and moisture
//! calibration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{path::Path, time::Duration};

use crate::sim::Scenario;
use crate::thresholds::Thresholds;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub device: DeviceSection,
    pub relay: RelaySection,
    pub thresholds: Thresholds,
    pub timing: TimingSection,
    pub calibration: Calibration,
    pub sim: SimSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    /// Empty means connect anonymously.
    pub username: String,
    pub password: String,
    pub keep_alive_s: u64,
    pub reconnect_backoff_s: u64,
    /// How long startup waits for the first connection before the control
    /// loop starts without it.
    pub connect_grace_s: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            keep_alive_s: 30,
            reconnect_backoff_s: 5,
            connect_grace_s: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub farm_id: String,
    pub device_id: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            farm_id: "farm_001".to_string(),
            device_id: "node_a1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub gpio_pin: i64,
    /// Most hobby relay modules switch on when the input is pulled LOW.
    pub active_low: bool,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            gpio_pin: 5,
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub sample_every_s: u64,
    pub tick_ms: u64,
    pub max_irrigation_s: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            sample_every_s: 300,
            tick_ms: 1000,
            max_irrigation_s: 10,
        }
    }
}

impl TimingSection {
    pub fn sample_every(&self) -> Duration {
        Duration::from_secs(self.sample_every_s)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn max_irrigation(&self) -> Duration {
        Duration::from_secs(self.max_irrigation_s)
    }
}

/// Raw ADC endpoints for the soil probe.  Resistive probes read high when
/// wet, capacitive ones read high when dry, so either ordering is valid.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub moisture_raw_dry: i32,
    pub moisture_raw_wet: i32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            moisture_raw_dry: 3500,
            moisture_raw_wet: 1500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimSection {
    pub scenario: String,
    pub diurnal_period_s: f64,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            scenario: "drying".to_string(),
            diurnal_period_s: 600.0,
        }
    }
}

impl SimSection {
    pub fn scenario(&self) -> Scenario {
        Scenario::from_str_lossy(&self.scenario)
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// Full scale of the 12-bit analog input the soil probe is wired to.
pub const ADC_MAX: i32 = 4095;

/// Characters with meaning in MQTT topic filters.
const TOPIC_RESERVED: &[char] = &['/', '+', '#'];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_calibration(&mut errors);
        self.validate_timing(&mut errors);

        let period = self.sim.diurnal_period_s;
        if !(period.is_finite() && period > 0.0) {
            errors.push(format!(
                "sim: diurnal_period_s must be a positive number of seconds, got {period}"
            ));
        }

        if !VALID_GPIO_PINS.contains(&self.relay.gpio_pin) {
            errors.push(format!(
                "relay: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.relay.gpio_pin
            ));
        }

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

    fn validate_identity(&self, errors: &mut Vec<String>) {
        for (field, value) in [
            ("farm_id", &self.device.farm_id),
            ("device_id", &self.device.device_id),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("device: {field} is empty"));
            } else if value.contains(TOPIC_RESERVED) {
                errors.push(format!(
                    "device: {field} '{value}' contains a reserved topic character (/, +, #)"
                ));
            }
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".to_string());
        }
        if m.keep_alive_s < 5 {
            errors.push(format!(
                "mqtt: keep_alive_s must be at least 5, got {}",
                m.keep_alive_s
            ));
        }
        if m.reconnect_backoff_s == 0 {
            errors.push("mqtt: reconnect_backoff_s must be positive".to_string());
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        for (field, value) in [
            ("moisture_low", t.moisture_low),
            ("moisture_critical", t.moisture_critical),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!(
                    "thresholds: {field} {value} out of range [0, 100]"
                ));
            }
        }
        if t.moisture_critical >= t.moisture_low {
            errors.push(format!(
                "thresholds: moisture_critical ({}) must be below moisture_low ({})",
                t.moisture_critical, t.moisture_low
            ));
        }
        if t.temp_critical <= t.temp_high {
            errors.push(format!(
                "thresholds: temp_critical ({}) must be above temp_high ({})",
                t.temp_critical, t.temp_high
            ));
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        let c = &self.calibration;
        for (field, value) in [
            ("moisture_raw_dry", c.moisture_raw_dry),
            ("moisture_raw_wet", c.moisture_raw_wet),
        ] {
            if !(0..=ADC_MAX).contains(&value) {
                errors.push(format!(
                    "calibration: {field} {value} out of ADC range [0, {ADC_MAX}]"
                ));
            }
        }
        if c.moisture_raw_dry == c.moisture_raw_wet {
            errors.push(format!(
                "calibration: moisture_raw_dry and moisture_raw_wet are both {}; calibration range is zero",
                c.moisture_raw_dry
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        if t.sample_every_s == 0 {
            errors.push("timing: sample_every_s must be positive".to_string());
        }
        if t.tick_ms == 0 {
            errors.push("timing: tick_ms must be positive".to_string());
        }
        if t.max_irrigation_s == 0 {
            errors.push("timing: max_irrigation_s must be positive".to_string());
        }
        if t.tick_ms > 0 && t.max_irrigation_s > 0 && t.tick() >= t.max_irrigation() {
            errors.push(format!(
                "timing: tick_ms ({}) must be shorter than max_irrigation_s ({})",
                t.tick_ms, t.max_irrigation_s
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Overlay values from the environment (or any other lookup) on top of
    /// the file contents.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            match v.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => tracing::warn!(value = %v, "ignoring unparsable MQTT_PORT"),
            }
        }
        if let Some(v) = lookup("MQTT_USERNAME") {
            self.mqtt.username = v;
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = v;
        }
        if let Some(v) = lookup("FARM_ID") {
            self.device.farm_id = v;
        }
        if let Some(v) = lookup("DEVICE_ID") {
            self.device.device_id = v;
        }
        if let Some(v) = lookup("SIM_SCENARIO") {
            self.sim.scenario = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file.  A missing file yields the built-in
/// defaults.
pub fn read(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using built-in defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

/// Read the file, apply environment overrides, and validate the result.
pub fn load(path: &str) -> Result<Config> {
    let mut config = read(path)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        farm_id = %config.device.farm_id,
        device_id = %config.device.device_id,
        broker = format_args!("{}:{}", config.mqtt.host, config.mqtt.port),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
