//! Telemetry event vocabulary emitted by the executor and the PASS broker.

use serde::{Deserialize, Serialize};

pub const EVENT_SELECTED: &str = "capsule.selected";
pub const EVENT_ADMITTED: &str = "capsule.admitted";
pub const EVENT_DENIED: &str = "capsule.denied";
pub const EVENT_DISPATCHED: &str = "capsule.dispatched";
pub const EVENT_AUDITED: &str = "capsule.audited";
pub const EVENT_BLOCKED: &str = "capsule.blocked";
pub const EVENT_COMPLETED: &str = "capsule.completed";
pub const EVENT_FAILED: &str = "capsule.failed";
pub const EVENT_REFLEX: &str = "capsule.reflex";
pub const EVENT_PASS_ASSIST: &str = "pass.assist";
pub const EVENT_PASS_RESUME: &str = "pass.resume";
pub const EVENT_PASS_DEPTH_EXCEEDED: &str = "pass.depth_exceeded";

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub capsule_id: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl TelemetryEvent {
    pub fn new(name: &str, capsule_id: &str) -> Self {
        Self {
            name: name.to_string(),
            capsule_id: capsule_id.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}
