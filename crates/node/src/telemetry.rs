//! Telemetry publisher: serialises readings and alerts and hands them to a
//! [`Publish`] sink, one message each, no batching.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::sensor::Reading;
use crate::thresholds::AlertCondition;
use crate::topics::Topics;

/// Minimal publish interface so telemetry doesn't depend on the MQTT client.
pub trait Publish {
    /// Attempt delivery of `payload` to `topic` once.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "sensor_reading", rename_all = "camelCase")]
struct ReadingMsg {
    soil_moisture: f32,
    air_temperature: f32,
    air_humidity: f32,
    light_intensity: f32,
}

impl From<&Reading> for ReadingMsg {
    fn from(r: &Reading) -> Self {
        Self {
            soil_moisture: r.soil_moisture,
            air_temperature: r.air_temperature,
            air_humidity: r.air_humidity,
            light_intensity: r.light_intensity,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "alert", rename_all = "camelCase")]
struct AlertMsg {
    alert_type: &'static str,
    message: String,
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct Telemetry {
    sensor_topic: String,
    alert_topic: String,
}

impl Telemetry {
    pub fn new(topics: &Topics) -> Self {
        Self {
            sensor_topic: topics.sensor.clone(),
            alert_topic: topics.alert.clone(),
        }
    }

    pub fn publish_reading(&self, sink: &impl Publish, reading: &Reading) -> Result<()> {
        let payload =
            serde_json::to_vec(&ReadingMsg::from(reading)).context("serialise reading")?;
        sink.publish(&self.sensor_topic, payload)
    }

    pub fn publish_alert(&self, sink: &impl Publish, alert: &AlertCondition) -> Result<()> {
        let msg = AlertMsg {
            alert_type: alert.kind(),
            message: alert.to_string(),
        };
        let payload = serde_json::to_vec(&msg).context("serialise alert")?;
        sink.publish(&self.alert_topic, payload)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
