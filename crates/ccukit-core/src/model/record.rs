// ── Normalized value records ──

use ccukit_rpc::Value;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::paramset::ParameterDescription;

/// Epoch milliseconds, the timestamp unit used throughout.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The latest normalized observation of one datapoint.
///
/// Keyed by `iface.channel.datapoint`. Created on first observation,
/// mutated in place on every later one, never deleted — the store keeps
/// answering "last known value" while an interface is down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub iface: String,
    /// Owning device address, when the channel is known to the registry.
    pub device: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub channel: String,
    pub channel_name: Option<String>,
    pub channel_type: Option<String>,
    pub channel_index: Option<i64>,
    pub datapoint: String,
    /// Fully qualified key: `iface.channel.datapoint`.
    pub datapoint_name: String,
    pub rooms: Vec<String>,
    /// Convenience single room when the channel is in exactly one.
    pub room: Option<String>,
    pub functions: Vec<String>,
    pub function: Option<String>,

    pub payload: Value,
    pub previous: Option<Value>,
    pub ts: i64,
    pub ts_previous: Option<i64>,
    /// Last-changed timestamp: bumped only when the payload differs.
    pub lc: i64,
    pub lc_previous: Option<i64>,

    /// Origin is the controller's own cache, not a live push.
    pub cache: bool,
    /// Differs from the stored state (ACTION datapoints always do).
    pub change: bool,
    /// Actuator is mid-transition.
    pub working: bool,
    pub stable: bool,
    /// Loaded from disk or stamped with the epoch sentinel; the live
    /// value may differ.
    pub uncertain: bool,
    /// Movement direction companion, when the channel reports one.
    pub direction: Option<i64>,

    /// Schema snapshot at normalization time, when cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ParameterDescription>,
}

impl ValueRecord {
    /// The store key for an observation.
    pub fn key(iface: &str, channel: &str, datapoint: &str) -> String {
        format!("{iface}.{channel}.{datapoint}")
    }
}
