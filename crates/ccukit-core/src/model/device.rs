// ── Device descriptors ──

use std::collections::BTreeMap;

use ccukit_rpc::Value;
use serde::{Deserialize, Serialize};

/// A device or channel descriptor as the controller reports it.
///
/// Wire keys are UPPERCASE; anything beyond the fields we interpret is
/// kept verbatim in `extra` so listDevices answers and persisted
/// snapshots stay faithful to what the controller sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    #[serde(rename = "ADDRESS")]
    pub address: String,

    #[serde(rename = "TYPE", default)]
    pub device_type: String,

    /// Owning device address; empty for top-level devices.
    #[serde(rename = "PARENT", default, skip_serializing_if = "String::is_empty")]
    pub parent: String,

    #[serde(rename = "PARENT_TYPE", default, skip_serializing_if = "String::is_empty")]
    pub parent_type: String,

    #[serde(rename = "CHILDREN", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,

    #[serde(rename = "PARAMSETS", default, skip_serializing_if = "Vec::is_empty")]
    pub paramsets: Vec<String>,

    #[serde(rename = "FIRMWARE", default, skip_serializing_if = "String::is_empty")]
    pub firmware: String,

    #[serde(rename = "VERSION", default)]
    pub version: i64,

    #[serde(rename = "RX_MODE", default, skip_serializing_if = "i64_is_zero")]
    pub rx_mode: i64,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn i64_is_zero(v: &i64) -> bool {
    *v == 0
}

impl DeviceDescription {
    /// Channels carry a parent address; devices do not.
    pub fn is_channel(&self) -> bool {
        !self.parent.is_empty()
    }

    /// The numeric suffix of a channel address (`ABC123:1` -> 1).
    pub fn channel_index(&self) -> Option<i64> {
        self.address.rsplit_once(':')?.1.parse().ok()
    }

    /// Parse a descriptor from an inbound wire struct.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let json = serde_json::to_value(value).ok()?;
        serde_json::from_value(json).ok()
    }

    /// Re-serialize for a listDevices answer (empty fields stripped).
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or_else(|_| Value::empty())
    }
}
