// ── Device registry ──

use std::collections::BTreeMap;

use ccukit_rpc::Value;
use dashmap::DashMap;
use tracing::debug;

use crate::model::DeviceDescription;

/// Per-interface map of device/channel descriptors, plus a type index
/// for fast type-based lookup.
///
/// Registry size is bounded by the controller's device count (hundreds),
/// so the name lookups below are deliberate linear scans.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    interfaces: DashMap<String, BTreeMap<String, DeviceDescription>>,
    /// `iface/TYPE` -> addresses.
    by_type: DashMap<String, Vec<String>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a descriptor. Idempotent; returns true when the
    /// address was previously unknown.
    pub fn add_device(&self, iface: &str, desc: DeviceDescription) -> bool {
        let type_key = format!("{iface}/{}", desc.device_type);
        let address = desc.address.clone();
        let fresh = self
            .interfaces
            .entry(iface.to_owned())
            .or_default()
            .insert(address.clone(), desc)
            .is_none();
        if fresh {
            let mut index = self.by_type.entry(type_key).or_default();
            if !index.contains(&address) {
                index.push(address);
            }
        }
        fresh
    }

    /// Remove a descriptor. Idempotent.
    pub fn remove_device(&self, iface: &str, address: &str) -> Option<DeviceDescription> {
        let removed = self
            .interfaces
            .get_mut(iface)
            .and_then(|mut devices| devices.remove(address));
        if let Some(desc) = &removed {
            let type_key = format!("{iface}/{}", desc.device_type);
            if let Some(mut index) = self.by_type.get_mut(&type_key) {
                index.retain(|a| a != address);
            }
            debug!(iface, address, "device removed");
        }
        removed
    }

    pub fn get(&self, iface: &str, address: &str) -> Option<DeviceDescription> {
        self.interfaces.get(iface)?.get(address).cloned()
    }

    /// The parent descriptor of a channel, if registered.
    pub fn parent_of(&self, iface: &str, desc: &DeviceDescription) -> Option<DeviceDescription> {
        if desc.parent.is_empty() {
            return None;
        }
        self.get(iface, &desc.parent)
    }

    pub fn devices_of_type(&self, iface: &str, device_type: &str) -> Vec<String> {
        self.by_type
            .get(&format!("{iface}/{device_type}"))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Which interface a channel address belongs to.
    pub fn find_iface(&self, address: &str) -> Option<String> {
        self.interfaces
            .iter()
            .find(|entry| entry.value().contains_key(address))
            .map(|entry| entry.key().clone())
    }

    pub fn has_devices(&self, iface: &str) -> bool {
        self.interfaces.get(iface).is_some_and(|d| !d.is_empty())
    }

    pub fn device_count(&self, iface: &str) -> usize {
        self.interfaces.get(iface).map_or(0, |d| d.len())
    }

    /// Addresses known for an interface.
    pub fn addresses(&self, iface: &str) -> Vec<String> {
        self.interfaces
            .get(iface)
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Shape the answer to the controller's inbound listDevices call.
    ///
    /// HmIP-RF and VirtualDevices compare full descriptors, everything
    /// else only wants address+version. The HmIP virtual remote
    /// (HmIP-RCV-1*) is left out: echoing it back makes the interface
    /// process re-announce all fifty of its channels on every connect.
    pub fn list_answer(&self, iface: &str) -> Value {
        let rich = iface == "HmIP-RF" || iface == "VirtualDevices";
        let mut answer = Vec::new();
        if let Some(devices) = self.interfaces.get(iface) {
            for (address, desc) in devices.iter() {
                if rich {
                    if address.starts_with("HmIP-RCV-1") {
                        continue;
                    }
                    answer.push(desc.to_wire());
                } else {
                    answer.push(Value::Struct(BTreeMap::from([
                        ("ADDRESS".to_owned(), Value::String(address.clone())),
                        ("VERSION".to_owned(), Value::Int(desc.version)),
                    ])));
                }
            }
        }
        Value::Array(answer)
    }

    /// Full snapshot for persistence.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, DeviceDescription>> {
        self.interfaces
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Cold-start load of a persisted snapshot.
    pub fn load(&self, snapshot: BTreeMap<String, BTreeMap<String, DeviceDescription>>) {
        for (iface, devices) in snapshot {
            for (_, desc) in devices {
                self.add_device(&iface, desc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(address: &str, parent: &str, device_type: &str) -> DeviceDescription {
        DeviceDescription {
            address: address.to_owned(),
            device_type: device_type.to_owned(),
            parent: parent.to_owned(),
            parent_type: String::new(),
            children: Vec::new(),
            paramsets: vec!["VALUES".to_owned()],
            firmware: String::new(),
            version: 1,
            rx_mode: 0,
            extra: BTreeMap::new(),
        }
    }

    fn device(address: &str, device_type: &str) -> DeviceDescription {
        DeviceDescription {
            firmware: "1.0".to_owned(),
            ..channel(address, "", device_type)
        }
    }

    #[test]
    fn add_is_idempotent_and_indexes_by_type() {
        let registry = DeviceRegistry::new();
        assert!(registry.add_device("BidCos-RF", device("NEQ1", "HM-LC-Sw1")));
        assert!(!registry.add_device("BidCos-RF", device("NEQ1", "HM-LC-Sw1")));
        assert_eq!(registry.devices_of_type("BidCos-RF", "HM-LC-Sw1"), vec!["NEQ1"]);
        assert_eq!(registry.find_iface("NEQ1"), Some("BidCos-RF".to_owned()));
    }

    #[test]
    fn remove_purges_type_index() {
        let registry = DeviceRegistry::new();
        registry.add_device("BidCos-RF", device("NEQ1", "HM-LC-Sw1"));
        assert!(registry.remove_device("BidCos-RF", "NEQ1").is_some());
        assert!(registry.remove_device("BidCos-RF", "NEQ1").is_none());
        assert!(registry.devices_of_type("BidCos-RF", "HM-LC-Sw1").is_empty());
        assert!(!registry.has_devices("BidCos-RF"));
    }

    #[test]
    fn minimal_list_answer_has_address_and_version_only() {
        let registry = DeviceRegistry::new();
        registry.add_device("BidCos-RF", device("NEQ1", "HM-LC-Sw1"));
        let answer = registry.list_answer("BidCos-RF");
        let items = answer.as_array().expect("array");
        assert_eq!(items.len(), 1);
        let entry = items[0].as_struct().expect("struct");
        assert_eq!(entry.len(), 2);
        assert_eq!(items[0].get("ADDRESS"), Some(&Value::String("NEQ1".into())));
    }

    #[test]
    fn hmip_answer_is_rich_and_skips_virtual_remote() {
        let registry = DeviceRegistry::new();
        registry.add_device("HmIP-RF", device("0001ABCD", "HmIP-BSM"));
        registry.add_device("HmIP-RF", channel("0001ABCD:4", "0001ABCD", "SWITCH_VIRTUAL_RECEIVER"));
        registry.add_device("HmIP-RF", device("HmIP-RCV-1", "HmIP-RCV-50"));
        registry.add_device("HmIP-RF", channel("HmIP-RCV-1:1", "HmIP-RCV-1", "KEY_TRANSCEIVER"));
        let answer = registry.list_answer("HmIP-RF");
        let items = answer.as_array().expect("array");
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|v| v.get("TYPE").is_some()));
    }

    #[test]
    fn snapshot_round_trip() {
        let registry = DeviceRegistry::new();
        registry.add_device("CUxD", device("CUX4000101", "CUX-HM-LC-Sw1"));
        let other = DeviceRegistry::new();
        other.load(registry.snapshot());
        assert_eq!(other.device_count("CUxD"), 1);
        assert_eq!(other.devices_of_type("CUxD", "CUX-HM-LC-Sw1"), vec!["CUX4000101"]);
    }
}
