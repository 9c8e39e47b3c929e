// ── Value store ──

use std::collections::BTreeMap;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::model::ValueRecord;

/// One store slot: the latest record plus the scheduled settling task
/// for working-capable datapoints. Arming a new settle window aborts
/// the previous handle (cancel-and-replace, last write wins).
#[derive(Debug)]
pub struct ValueSlot {
    pub record: ValueRecord,
    debounce: Option<JoinHandle<()>>,
}

/// Latest normalized record per datapoint. Records are never deleted;
/// the store answers "last known value" even while an interface is down.
#[derive(Debug, Default)]
pub struct ValueStore {
    slots: DashMap<String, ValueSlot>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ValueRecord> {
        self.slots.get(key).map(|slot| slot.record.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store a record, computed by `build` from the previous one.
    /// Returns a clone of what was stored.
    pub fn upsert(
        &self,
        key: &str,
        build: impl FnOnce(Option<&ValueRecord>) -> ValueRecord,
    ) -> ValueRecord {
        match self.slots.entry(key.to_owned()) {
            dashmap::Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                let next = build(Some(&slot.record));
                slot.record = next.clone();
                next
            }
            dashmap::Entry::Vacant(entry) => {
                let record = build(None);
                entry.insert(ValueSlot { record: record.clone(), debounce: None });
                record
            }
        }
    }

    /// Mutate a stored record in place (settle-time flag resolution).
    pub fn with_record_mut(&self, key: &str, apply: impl FnOnce(&mut ValueRecord)) -> Option<ValueRecord> {
        let mut slot = self.slots.get_mut(key)?;
        apply(&mut slot.record);
        Some(slot.record.clone())
    }

    /// Arm the settle timer for a datapoint, aborting any previous one.
    pub fn arm_debounce(&self, key: &str, handle: JoinHandle<()>) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            if let Some(old) = slot.debounce.replace(handle) {
                old.abort();
            }
        } else {
            handle.abort();
        }
    }

    /// Drop the settle handle once it has fired.
    pub fn clear_debounce(&self, key: &str) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.debounce = None;
        }
    }

    /// Abort every armed settle timer (shutdown path).
    pub fn abort_debounces(&self) {
        for mut slot in self.slots.iter_mut() {
            if let Some(handle) = slot.debounce.take() {
                handle.abort();
            }
        }
    }

    /// Visit every record (cache replay for new subscribers).
    pub fn for_each(&self, mut visit: impl FnMut(&ValueRecord)) {
        for slot in self.slots.iter() {
            visit(&slot.record);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, ValueRecord> {
        self.slots
            .iter()
            .map(|slot| (slot.key().clone(), slot.record.clone()))
            .collect()
    }

    /// Cold-start load. Disk values may be stale, so every record is
    /// re-tagged as cache-origin, unchanged and uncertain.
    pub fn load_cold(&self, snapshot: BTreeMap<String, ValueRecord>) {
        for (key, mut record) in snapshot {
            record.cache = true;
            record.change = false;
            record.uncertain = true;
            self.slots.insert(key, ValueSlot { record, debounce: None });
        }
    }
}
