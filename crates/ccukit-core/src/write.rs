// ── Outbound write path ──
//
// Two ways out: the serialized queue (one write in flight, per-item
// timeout, optional pause) and the throttled direct path for
// high-frequency interactive controls. Both are wired to an injected
// executor so they stay testable without a session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ccukit_rpc::Value;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CcuError;
use crate::model::{ParameterDescription, ParameterType, ValueRecord};

pub type WriteOutcome = Result<(), CcuError>;

/// One outbound setValue, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub iface: String,
    pub address: String,
    pub datapoint: String,
    pub value: Value,
    pub burst: bool,
}

impl WriteRequest {
    fn key(&self) -> String {
        format!("{}.{}.{}", self.iface, self.address, self.datapoint)
    }
}

/// The function that actually performs a write RPC.
pub type WriteExecutor =
    Arc<dyn Fn(WriteRequest) -> BoxFuture<'static, WriteOutcome> + Send + Sync>;

struct PendingWrite {
    request: WriteRequest,
    reply: oneshot::Sender<WriteOutcome>,
}

// ── Serialized queue ──

/// FIFO across datapoints, coalescing per datapoint: a newer request to
/// the same (iface, address, datapoint) replaces the queued one, whose
/// caller is rejected as superseded. At most one write is in flight.
pub struct WriteQueue {
    queue: Arc<Mutex<VecDeque<PendingWrite>>>,
    notify: Arc<Notify>,
}

impl WriteQueue {
    /// Create the queue and spawn its runner.
    pub fn start(
        executor: WriteExecutor,
        item_timeout: Duration,
        pause: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let queue: Arc<Mutex<VecDeque<PendingWrite>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        let runner_queue = Arc::clone(&queue);
        let runner_notify = Arc::clone(&notify);
        tokio::spawn(async move {
            loop {
                let next = runner_queue.lock().ok().and_then(|mut q| q.pop_front());
                let Some(item) = next else {
                    tokio::select! {
                        () = runner_notify.notified() => continue,
                        () = cancel.cancelled() => return,
                    }
                };
                // The RPC keeps running past its deadline; a late result
                // is discarded, not delivered.
                let task = tokio::spawn((executor)(item.request.clone()));
                let outcome = match tokio::time::timeout(item_timeout, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) => Err(CcuError::Transport(format!("write task failed: {join}"))),
                    Err(_) => {
                        warn!(key = %item.request.key(), "queued write timed out");
                        Err(CcuError::QueueTimeout(item_timeout))
                    }
                };
                let _ = item.reply.send(outcome);
                if !pause.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(pause) => {}
                        () = cancel.cancelled() => return,
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
        });

        WriteQueue { queue, notify }
    }

    /// Enqueue a write. Returns the channel the outcome arrives on.
    pub fn submit(&self, request: WriteRequest) -> oneshot::Receiver<WriteOutcome> {
        let (reply, rx) = oneshot::channel();
        let key = request.key();
        if let Ok(mut queue) = self.queue.lock() {
            if let Some(existing) = queue.iter_mut().find(|p| p.request.key() == key) {
                debug!(%key, "coalescing queued write");
                let superseded = std::mem::replace(existing, PendingWrite { request, reply });
                let _ = superseded.reply.send(Err(CcuError::Superseded));
            } else {
                queue.push_back(PendingWrite { request, reply });
            }
        }
        self.notify.notify_one();
        rx
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a queued write can be skipped entirely: the store already
/// holds this exact value from a live observation, the caller did not
/// force, and the datapoint is stateful.
pub fn is_redundant(current: Option<&ValueRecord>, value: &Value, force: bool) -> bool {
    if force {
        return false;
    }
    let Some(record) = current else {
        return false;
    };
    if record.cache || record.datapoint.starts_with("PRESS_") {
        return false;
    }
    if record.schema.as_ref().is_some_and(ParameterDescription::is_action) {
        return false;
    }
    record.payload == *value
}

// ── Throttled direct path ──

#[derive(Default)]
struct ThrottleSlot {
    pending: Option<PendingWrite>,
}

/// Per-datapoint write throttle for interactive controls (dimmer drags).
///
/// The first write fires immediately and opens a window; writes landing
/// inside the window go into a one-slot cache where only the latest
/// survives (earlier ones reject as superseded) and flush when the
/// window elapses, which re-opens it.
pub struct Throttle {
    slots: Arc<DashMap<String, ThrottleSlot>>,
    executor: WriteExecutor,
    window: Duration,
    cancel: CancellationToken,
}

impl Throttle {
    pub fn new(executor: WriteExecutor, window: Duration, cancel: CancellationToken) -> Self {
        Throttle { slots: Arc::new(DashMap::new()), executor, window, cancel }
    }

    pub fn submit(&self, request: WriteRequest) -> oneshot::Receiver<WriteOutcome> {
        let (reply, rx) = oneshot::channel();
        let key = request.key();
        match self.slots.entry(key.clone()) {
            dashmap::Entry::Vacant(entry) => {
                entry.insert(ThrottleSlot::default());
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move {
                    let _ = reply.send((executor)(request).await);
                });
                self.spawn_window(key);
            }
            dashmap::Entry::Occupied(mut entry) => {
                if let Some(old) = entry.get_mut().pending.replace(PendingWrite { request, reply })
                {
                    let _ = old.reply.send(Err(CcuError::Superseded));
                }
            }
        }
        rx
    }

    fn spawn_window(&self, key: String) {
        let slots = Arc::clone(&self.slots);
        let executor = Arc::clone(&self.executor);
        let window = self.window;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(window) => {}
                    () = cancel.cancelled() => return,
                }
                let flushed = slots.get_mut(&key).and_then(|mut slot| slot.pending.take());
                match flushed {
                    Some(item) => {
                        let _ = item.reply.send((executor)(item.request).await);
                    }
                    None => {
                        // A racing submit may have landed between the take
                        // and here; only close the window if it stayed empty.
                        if slots.remove_if(&key, |_, slot| slot.pending.is_none()).is_some() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

// ── Type coercion ──

/// Coerce a caller-supplied value to the wire type the schema demands.
///
/// Without a schema the cast is conservative: numbers degrade to
/// strings, which every interface process accepts for unknown
/// parameters.
pub fn param_cast(schema: Option<&ParameterDescription>, value: &Value, clamp: bool) -> Value {
    let Some(schema) = schema else {
        return unknown_cast(value);
    };
    match schema.param_type {
        ParameterType::Bool | ParameterType::Action => Value::Bool(cast_bool(value)),
        ParameterType::Float => {
            let mut number = cast_f64(value);
            if clamp {
                if let Some(min) = schema.min.as_ref().and_then(Value::as_f64) {
                    number = number.max(min);
                }
                if let Some(max) = schema.max.as_ref().and_then(Value::as_f64) {
                    number = number.min(max);
                }
            }
            Value::Double(number)
        }
        ParameterType::Enum | ParameterType::Integer => {
            if let Value::String(label) = value {
                if let Some(index) = schema.enum_index(label) {
                    return Value::Int(index);
                }
            }
            let mut number = cast_i64(value);
            if clamp && schema.param_type == ParameterType::Integer {
                if let Some(min) = schema.min.as_ref().and_then(Value::as_i64) {
                    number = number.max(min);
                }
                if let Some(max) = schema.max.as_ref().and_then(Value::as_i64) {
                    number = number.min(max);
                }
            }
            Value::Int(number)
        }
        ParameterType::String => Value::String(value.to_string()),
        ParameterType::Unknown => unknown_cast(value),
    }
}

fn unknown_cast(value: &Value) -> Value {
    match value {
        Value::Int(i) => {
            warn!(value = %i, "no schema for datapoint, sending number as string");
            Value::String(i.to_string())
        }
        Value::Double(d) => {
            warn!(value = %d, "no schema for datapoint, sending number as string");
            Value::String(d.to_string())
        }
        other => other.clone(),
    }
}

/// Numeric-aware boolean: the strings "false" and "0" are falsy, other
/// non-empty strings truthy.
fn cast_bool(value: &Value) -> bool {
    match value {
        Value::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        other => other.is_truthy(),
    }
}

fn cast_f64(value: &Value) -> f64 {
    match value {
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        other => other.as_f64().unwrap_or(0.0),
    }
}

fn cast_i64(value: &Value) -> i64 {
    match value {
        Value::Bool(b) => i64::from(*b),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .unwrap_or(0),
        other => other.as_i64().unwrap_or(0),
    }
}
