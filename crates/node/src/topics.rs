/// The node's MQTT topics, derived once from its farm and device ids.
///
/// - sensor data: `farm/<farm_id>/sensor/<device_id>`
/// - alerts:      `farm/<farm_id>/alert/<device_id>`
/// - presence:    `farm/<farm_id>/status/<device_id>`
/// - commands:    `farm/<farm_id>/device/<device_id>/command` (subscribed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub sensor: String,
    pub alert: String,
    pub status: String,
    pub command: String,
}

impl Topics {
    pub fn new(farm_id: &str, device_id: &str) -> Self {
        Self {
            sensor: format!("farm/{farm_id}/sensor/{device_id}"),
            alert: format!("farm/{farm_id}/alert/{device_id}"),
            status: format!("farm/{farm_id}/status/{device_id}"),
            command: format!("farm/{farm_id}/device/{device_id}/command"),
        }
    }

    pub fn is_command(&self, topic: &str) -> bool {
        topic == self.command
    }
}

// ===========================================================================
// Tests
// ===========================================================================
