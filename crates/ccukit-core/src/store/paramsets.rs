// ── Paramset description cache ──
//
// Schemas are immutable once fetched and cached indefinitely; population
// is lazy through a rate-limited fetch queue so a fresh session does not
// hammer the interface processes with hundreds of
// getParamsetDescription calls at once.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use regex::Regex;
use tokio::sync::Notify;
use tracing::debug;

use crate::model::{DeviceDescription, ParamsetDescription};

/// Flush the cache to disk after this many freshly fetched schemas.
pub const FLUSH_EVERY: usize = 30;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+:\d+$").expect("address regex")
});

/// Cache key for a paramset.
///
/// Channels have no firmware/version of their own: the key is resolved
/// through the parent device, with the channel's own type in the
/// channel-type slot. A paramset named like a peer address is a link
/// paramset and keys as `LINK`.
pub fn paramset_key(
    iface: &str,
    device: &DeviceDescription,
    parent: Option<&DeviceDescription>,
    paramset: &str,
) -> String {
    let paramset = if ADDRESS_RE.is_match(paramset) { "LINK" } else { paramset };
    let (root, channel_type) = match parent {
        Some(p) => (p, device.device_type.as_str()),
        None => (device, ""),
    };
    format!(
        "{iface}/{}/{}/{}/{channel_type}/{paramset}",
        root.device_type, root.firmware, root.version
    )
}

/// A queued getParamsetDescription fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub iface: String,
    pub address: String,
    pub paramset: String,
    pub key: String,
}

#[derive(Debug, Default)]
pub struct ParamsetCache {
    descriptions: DashMap<String, ParamsetDescription>,
    queue: Mutex<VecDeque<FetchRequest>>,
    queued_keys: Mutex<HashSet<String>>,
    notify: Notify,
    fetched_since_flush: AtomicUsize,
}

impl ParamsetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ParamsetDescription> {
        self.descriptions.get(key).map(|d| d.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.descriptions.contains_key(key)
    }

    /// Cached schema, or an empty placeholder plus a queued fetch.
    /// Never blocks the caller.
    pub fn get_or_enqueue(&self, request: FetchRequest) -> ParamsetDescription {
        if let Some(found) = self.get(&request.key) {
            return found;
        }
        self.enqueue(request);
        ParamsetDescription::new()
    }

    /// Queue a fetch unless the key is already cached or queued.
    pub fn enqueue(&self, request: FetchRequest) {
        if self.descriptions.contains_key(&request.key) {
            return;
        }
        {
            let Ok(mut queued) = self.queued_keys.lock() else { return };
            if !queued.insert(request.key.clone()) {
                return;
            }
        }
        debug!(key = %request.key, "paramset fetch queued");
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(request);
        }
        self.notify.notify_one();
    }

    /// Queue fetches for every paramset a descriptor exposes.
    pub fn enqueue_device(
        &self,
        iface: &str,
        desc: &DeviceDescription,
        parent: Option<&DeviceDescription>,
    ) {
        for paramset in &desc.paramsets {
            let key = paramset_key(iface, desc, parent, paramset);
            self.enqueue(FetchRequest {
                iface: iface.to_owned(),
                address: desc.address.clone(),
                paramset: paramset.clone(),
                key,
            });
        }
    }

    /// Next fetch to run; waits when the queue is empty. Keys that
    /// became known while queued are skipped.
    pub async fn next_request(&self) -> FetchRequest {
        loop {
            let popped = self.queue.lock().ok().and_then(|mut q| q.pop_front());
            match popped {
                Some(request) => {
                    if self.descriptions.contains_key(&request.key) {
                        if let Ok(mut queued) = self.queued_keys.lock() {
                            queued.remove(&request.key);
                        }
                        continue;
                    }
                    return request;
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Record a fetched schema. Returns true when the flush threshold is
    /// reached or the queue just drained.
    pub fn complete(&self, key: &str, description: ParamsetDescription) -> bool {
        self.descriptions.insert(key.to_owned(), description);
        if let Ok(mut queued) = self.queued_keys.lock() {
            queued.remove(key);
        }
        let fetched = self.fetched_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
        let drained = self.queue.lock().map(|q| q.is_empty()).unwrap_or(true);
        if fetched >= FLUSH_EVERY || drained {
            self.fetched_since_flush.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Drop a failed fetch so it can be requeued later.
    pub fn abandon(&self, key: &str) {
        if let Ok(mut queued) = self.queued_keys.lock() {
            queued.remove(key);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ParamsetDescription> {
        self.descriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn load(&self, snapshot: BTreeMap<String, ParamsetDescription>) {
        for (key, description) in snapshot {
            self.descriptions.insert(key, description);
        }
    }
}
