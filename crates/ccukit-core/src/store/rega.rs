// ── ReGa metadata index ──
//
// Channel names, rooms, functions and group membership come from the
// controller's logic layer, not the device bus. This index denormalizes
// them for the event pipeline and is persisted so a cold start can
// enrich records before the first poll completes.

use std::collections::BTreeMap;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct RegaIndex {
    /// channel address -> display name
    channel_names: DashMap<String, String>,
    /// channel address -> ReGa object id
    channel_ids: DashMap<String, i64>,
    channel_rooms: DashMap<String, Vec<String>>,
    channel_functions: DashMap<String, Vec<String>>,
    /// group channel address -> member channel addresses
    groups: DashMap<String, Vec<String>>,
    rooms: Mutex<Vec<String>>,
    functions: Mutex<Vec<String>>,
}

/// Serialized form of the index.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RegaSnapshot {
    pub channel_names: BTreeMap<String, String>,
    pub channel_ids: BTreeMap<String, i64>,
    pub channel_rooms: BTreeMap<String, Vec<String>>,
    pub channel_functions: BTreeMap<String, Vec<String>>,
    pub groups: BTreeMap<String, Vec<String>>,
    pub rooms: Vec<String>,
    pub functions: Vec<String>,
}

impl RegaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channel(&self, address: &str, id: i64, name: &str) {
        self.channel_names.insert(address.to_owned(), name.to_owned());
        self.channel_ids.insert(address.to_owned(), id);
    }

    pub fn set_rooms(&self, rooms: Vec<(String, Vec<String>)>) {
        self.channel_rooms.clear();
        let mut names = Vec::with_capacity(rooms.len());
        for (room, channels) in rooms {
            for channel in channels {
                self.channel_rooms.entry(channel).or_default().push(room.clone());
            }
            names.push(room);
        }
        if let Ok(mut guard) = self.rooms.lock() {
            *guard = names;
        }
    }

    pub fn set_functions(&self, functions: Vec<(String, Vec<String>)>) {
        self.channel_functions.clear();
        let mut names = Vec::with_capacity(functions.len());
        for (function, channels) in functions {
            for channel in channels {
                self.channel_functions
                    .entry(channel)
                    .or_default()
                    .push(function.clone());
            }
            names.push(function);
        }
        if let Ok(mut guard) = self.functions.lock() {
            *guard = names;
        }
    }

    pub fn set_groups(&self, groups: BTreeMap<String, Vec<String>>) {
        self.groups.clear();
        for (group, members) in groups {
            self.groups.insert(group, members);
        }
    }

    pub fn name_of(&self, address: &str) -> Option<String> {
        self.channel_names.get(address).map(|n| n.clone())
    }

    pub fn id_of(&self, address: &str) -> Option<i64> {
        self.channel_ids.get(address).map(|id| *id)
    }

    pub fn rooms_of(&self, address: &str) -> Vec<String> {
        self.channel_rooms.get(address).map(|r| r.clone()).unwrap_or_default()
    }

    pub fn functions_of(&self, address: &str) -> Vec<String> {
        self.channel_functions
            .get(address)
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups.get(group).map(|m| m.clone()).unwrap_or_default()
    }

    /// Reverse lookup of a channel address by its display name.
    pub fn find_channel_by_name(&self, name: &str) -> Option<String> {
        self.channel_names
            .iter()
            .find(|entry| entry.value() == name)
            .map(|entry| entry.key().clone())
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> RegaSnapshot {
        RegaSnapshot {
            channel_names: self
                .channel_names
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            channel_ids: self.channel_ids.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            channel_rooms: self
                .channel_rooms
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            channel_functions: self
                .channel_functions
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            groups: self.groups.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            rooms: self.room_names(),
            functions: self.function_names(),
        }
    }

    pub fn load(&self, snapshot: RegaSnapshot) {
        for (address, name) in snapshot.channel_names {
            self.channel_names.insert(address, name);
        }
        for (address, id) in snapshot.channel_ids {
            self.channel_ids.insert(address, id);
        }
        for (address, rooms) in snapshot.channel_rooms {
            self.channel_rooms.insert(address, rooms);
        }
        for (address, functions) in snapshot.channel_functions {
            self.channel_functions.insert(address, functions);
        }
        self.set_groups(snapshot.groups);
        if let Ok(mut guard) = self.rooms.lock() {
            *guard = snapshot.rooms;
        }
        if let Ok(mut guard) = self.functions.lock() {
            *guard = snapshot.functions;
        }
    }
}
