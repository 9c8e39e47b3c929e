// ── Event normalizer ──
//
// Turns raw (interface, channel, datapoint, payload) pushes into
// enriched value-store records and fans them out. The bus reports "new
// target value" and "now moving" as separate, out-of-order events;
// working-capable datapoints therefore settle through a short window
// before publishing, so downstream sees one coherent change instead of
// a state flash.

use std::sync::Arc;
use std::time::Duration;

use ccukit_rpc::Value;
use tracing::{debug, trace, warn};

use crate::model::{ParameterDescription, ValueRecord, now_ms};
use crate::store::{DeviceRegistry, FetchRequest, ParamsetCache, RegaIndex, ValueStore, paramset_key};
use crate::subscribe::SubscriptionEngine;

/// Origin and batch context for one raw observation.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Value came from the controller's cache, not a live push.
    pub cache: bool,
    /// Source timestamp was the epoch sentinel; the value may be stale.
    pub uncertain: bool,
    /// Working state pre-scanned from the same multicall batch.
    pub working: Option<bool>,
    /// Direction pre-scanned from the same multicall batch.
    pub direction: Option<i64>,
}

impl EventContext {
    pub fn live() -> Self {
        EventContext::default()
    }

    pub fn cached(uncertain: bool) -> Self {
        EventContext { cache: true, uncertain, ..EventContext::default() }
    }
}

#[derive(Clone)]
pub struct Normalizer {
    inner: Arc<NormalizerInner>,
}

struct NormalizerInner {
    registry: Arc<DeviceRegistry>,
    paramsets: Arc<ParamsetCache>,
    rega: Arc<RegaIndex>,
    values: Arc<ValueStore>,
    subscriptions: Arc<SubscriptionEngine>,
    debounce: Duration,
}

impl Normalizer {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        paramsets: Arc<ParamsetCache>,
        rega: Arc<RegaIndex>,
        values: Arc<ValueStore>,
        subscriptions: Arc<SubscriptionEngine>,
        debounce: Duration,
    ) -> Self {
        Normalizer {
            inner: Arc::new(NormalizerInner {
                registry,
                paramsets,
                rega,
                values,
                subscriptions,
                debounce,
            }),
        }
    }

    /// Normalize one raw observation, update the store, and publish —
    /// immediately, or after the settle window for working-capable
    /// datapoints. Returns the stored record, `None` for suppressed
    /// events (PONG liveness beacons).
    pub fn handle_event(
        &self,
        iface: &str,
        channel: &str,
        datapoint: &str,
        payload: Value,
        ctx: EventContext,
    ) -> Option<ValueRecord> {
        // PONG answers refresh interface liveness upstream; they carry
        // no device state and are not published.
        if channel == "CENTRAL" && datapoint == "PONG" {
            trace!(iface, "pong");
            return None;
        }

        let record = self.build_record(iface, channel, datapoint, payload, &ctx);
        let key = record.datapoint_name.clone();

        if ctx.cache {
            // Momentary press events must never be replayed as state.
            if !datapoint.starts_with("PRESS_") {
                self.inner.subscriptions.publish(&record);
            }
            return Some(record);
        }

        let working_capable = record
            .channel_type
            .as_deref()
            .is_some_and(|t| is_working_capable(t, datapoint));
        if working_capable {
            self.arm_settle(&key, iface.to_owned(), channel.to_owned());
        } else {
            self.inner.subscriptions.publish(&record);
        }
        Some(record)
    }

    /// Unpack a multicall batch: working/direction companions are
    /// pre-scanned so every event in the batch normalizes against the
    /// batch's own view of the actuator state. Returns the number of
    /// event calls handled.
    pub fn handle_multicall(&self, iface: &str, calls: &[Value]) -> usize {
        let mut events = Vec::new();
        for call in calls {
            let Some("event") = call.get("methodName").and_then(Value::as_str) else {
                warn!(iface, "non-event entry in multicall batch");
                continue;
            };
            let Some(params) = call.get("params").and_then(Value::as_array) else {
                continue;
            };
            // params: [session_id, channel, datapoint, value]
            if let (Some(channel), Some(datapoint), Some(value)) = (
                params.get(1).and_then(Value::as_str),
                params.get(2).and_then(Value::as_str),
                params.get(3),
            ) {
                events.push((channel.to_owned(), datapoint.to_owned(), value.clone()));
            }
        }

        let mut handled = 0;
        for (channel, datapoint, value) in &events {
            let mut ctx = EventContext::live();
            for (other_channel, other_dp, other_value) in &events {
                if other_channel != channel {
                    continue;
                }
                match other_dp.as_str() {
                    "WORKING" | "WORKING_SLATS" | "PROCESS" => {
                        let busy = other_value.is_truthy();
                        ctx.working = Some(ctx.working.unwrap_or(false) || busy);
                    }
                    "DIRECTION" => ctx.direction = other_value.as_i64(),
                    "ACTIVITY_STATE" => {
                        ctx.direction = other_value.as_i64().map(swap_activity_state);
                    }
                    _ => {}
                }
            }
            if self.handle_event(iface, channel, datapoint, value.clone(), ctx).is_some() {
                handled += 1;
            }
        }
        handled
    }

    /// Ingest one entry of the initial value dump. RSSI readings come
    /// out of the logic layer offset by +256.
    pub fn load_cached(
        &self,
        iface: &str,
        channel: &str,
        datapoint: &str,
        payload: Value,
        source_ts: Option<i64>,
    ) {
        let payload = if datapoint == "RSSI_DEVICE" || datapoint == "RSSI_PEER" {
            match payload.as_i64() {
                Some(rssi) => Value::Int(rssi - 256),
                None => payload,
            }
        } else {
            payload
        };
        let uncertain = source_ts.is_none_or(|ts| ts <= 0);
        self.handle_event(iface, channel, datapoint, payload, EventContext::cached(uncertain));
    }

    // ── Record construction ──

    fn build_record(
        &self,
        iface: &str,
        channel: &str,
        datapoint: &str,
        payload: Value,
        ctx: &EventContext,
    ) -> ValueRecord {
        let inner = &self.inner;
        let desc = inner.registry.get(iface, channel);
        if desc.is_none() {
            debug!(iface, channel, "event from unregistered channel");
        }
        let parent = desc
            .as_ref()
            .and_then(|d| inner.registry.parent_of(iface, d));
        let schema = desc.as_ref().and_then(|d| {
            let key = paramset_key(iface, d, parent.as_ref(), "VALUES");
            let set = inner.paramsets.get_or_enqueue(FetchRequest {
                iface: iface.to_owned(),
                address: d.address.clone(),
                paramset: "VALUES".to_owned(),
                key,
            });
            set.get(datapoint).cloned()
        });

        let (working, direction) = self.resolve_motion(iface, channel, ctx);
        let rooms = inner.rega.rooms_of(channel);
        let functions = inner.rega.functions_of(channel);
        let key = ValueRecord::key(iface, channel, datapoint);
        let ts = now_ms();

        inner.values.upsert(&key, |previous| {
            let change = compute_change(schema.as_ref(), previous, &payload, working, ctx);
            let lc = match previous {
                Some(prev) if prev.payload == payload => prev.lc,
                _ => ts,
            };
            ValueRecord {
                iface: iface.to_owned(),
                device: desc.as_ref().map(|d| {
                    if d.parent.is_empty() { d.address.clone() } else { d.parent.clone() }
                }),
                device_name: desc.as_ref().and_then(|d| {
                    let device = if d.parent.is_empty() { &d.address } else { &d.parent };
                    inner.rega.name_of(device)
                }),
                device_type: desc.as_ref().map(|d| {
                    if d.parent.is_empty() { d.device_type.clone() } else { d.parent_type.clone() }
                }),
                channel: channel.to_owned(),
                channel_name: inner.rega.name_of(channel),
                channel_type: desc.as_ref().map(|d| d.device_type.clone()),
                channel_index: desc.as_ref().and_then(crate::model::DeviceDescription::channel_index),
                datapoint: datapoint.to_owned(),
                datapoint_name: key.clone(),
                room: if rooms.len() == 1 { rooms.first().cloned() } else { None },
                rooms: rooms.clone(),
                function: if functions.len() == 1 { functions.first().cloned() } else { None },
                functions: functions.clone(),
                payload: payload.clone(),
                previous: previous.map(|p| p.payload.clone()),
                ts,
                ts_previous: previous.map(|p| p.ts),
                lc,
                lc_previous: previous.map(|p| p.lc),
                cache: ctx.cache,
                change,
                working,
                stable: !working,
                uncertain: ctx.uncertain,
                direction,
                schema: schema.clone(),
            }
        })
    }

    /// Current working/direction view for a channel: batch context wins,
    /// then the companion datapoints already in the store.
    fn resolve_motion(&self, iface: &str, channel: &str, ctx: &EventContext) -> (bool, Option<i64>) {
        let values = &self.inner.values;
        let working = ctx.working.unwrap_or_else(|| {
            ["WORKING", "WORKING_SLATS", "PROCESS"].iter().any(|dp| {
                values
                    .get(&ValueRecord::key(iface, channel, dp))
                    .is_some_and(|r| r.payload.is_truthy())
            })
        });
        let direction = ctx.direction.or_else(|| {
            values
                .get(&ValueRecord::key(iface, channel, "DIRECTION"))
                .and_then(|r| r.payload.as_i64())
                .or_else(|| {
                    values
                        .get(&ValueRecord::key(iface, channel, "ACTIVITY_STATE"))
                        .and_then(|r| r.payload.as_i64())
                        .map(swap_activity_state)
                })
        });
        (working, direction)
    }

    /// Arm (or re-arm) the settle window for a working-capable
    /// datapoint. Last write wins: a newer raw event replaces the timer,
    /// and publication happens once, at fire time, with the motion
    /// companions resolved against the then-current store.
    fn arm_settle(&self, key: &str, iface: String, channel: String) {
        let this = self.clone();
        let key_owned = key.to_owned();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.inner.debounce).await;
            let ctx = EventContext::live();
            let (working, direction) = this.resolve_motion(&iface, &channel, &ctx);
            let settled = this.inner.values.with_record_mut(&key_owned, |record| {
                if record.stable == working {
                    // stability flipped since normalization; that is a change
                    record.change = true;
                }
                record.working = working;
                record.stable = !working;
                record.direction = direction;
            });
            this.inner.values.clear_debounce(&key_owned);
            if let Some(record) = settled {
                this.inner.subscriptions.publish(&record);
            }
        });
        self.inner.values.arm_debounce(key, handle);
    }
}

/// Whether a datapoint on this channel type reports transient busy
/// states and needs the settle window.
fn is_working_capable(channel_type: &str, datapoint: &str) -> bool {
    const LEVELED: [&str; 7] =
        ["DIMMER", "DUAL_WHITE", "BLIND", "SHUTTER", "JALOUSIE", "WINMATIC", "KEYMATIC"];
    const SWITCHED: [&str; 4] = ["SWITCH", "SIGNAL", "RAINDETECTOR_HEAT", "ALARMACTUATOR"];
    match datapoint {
        "STATE" => SWITCHED.iter().any(|t| channel_type.contains(t)),
        "ARMSTATE" => channel_type.contains("ARMING"),
        dp if dp.starts_with("LEVEL") => LEVELED.iter().any(|t| channel_type.contains(t)),
        _ => false,
    }
}

/// ACTIVITY_STATE and DIRECTION agree on UP/DOWN but swap the
/// none/undetermined codes.
fn swap_activity_state(activity: i64) -> i64 {
    match activity {
        0 => 3,
        3 => 0,
        other => other,
    }
}

fn compute_change(
    schema: Option<&ParameterDescription>,
    previous: Option<&ValueRecord>,
    payload: &Value,
    working: bool,
    ctx: &EventContext,
) -> bool {
    if ctx.cache {
        return false;
    }
    if schema.is_some_and(ParameterDescription::is_action) {
        return true;
    }
    match previous {
        None => true,
        Some(prev) => prev.cache || prev.payload != *payload || prev.stable == working,
    }
}
