//! In-memory hub/device store.
//!
//! Writers go through the [`DeviceModelBuilder`] owned by the store and
//! replace whole per-hub snapshots under a write lock. Readers clone an
//! `Arc` and never see a half-applied update.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::builder::DeviceModelBuilder;
use crate::mapping::DeviceRole;
use crate::model::{Device, Hub, IoState};
use crate::payload::{IoDelta, RawDevice, RawHub, RawSnapshot};

/// Immutable view of one hub and its devices.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSnapshot {
    pub hub: Hub,
    pub devices: BTreeMap<String, Arc<Device>>,
}

/// Result of applying an IO delta.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaOutcome {
    pub io: IoState,
    /// New role when the delta changed it.
    pub role_changed: Option<DeviceRole>,
}

pub struct DeviceStore {
    builder: DeviceModelBuilder,
    hubs: RwLock<HashMap<String, Arc<HubSnapshot>>>,
}

impl DeviceStore {
    pub fn new(builder: DeviceModelBuilder) -> Self {
        Self {
            builder,
            hubs: RwLock::new(HashMap::new()),
        }
    }

    pub fn builder(&self) -> &DeviceModelBuilder {
        &self.builder
    }

    /// Replace everything with a freshly built snapshot. Returns
    /// `(hubs, devices)` counts.
    ///
    /// Devices whose hub is missing from the snapshot are dropped.
    pub fn replace_all(&self, raw: &RawSnapshot) -> (usize, usize) {
        let built = self.builder.apply_snapshot(raw);
        let mut next: HashMap<String, HubSnapshot> = built
            .hubs
            .into_iter()
            .map(|hub| {
                (
                    hub.id.clone(),
                    HubSnapshot {
                        hub,
                        devices: BTreeMap::new(),
                    },
                )
            })
            .collect();

        let mut devices = 0;
        for device in built.devices {
            if let Some(snapshot) = next.get_mut(&device.hub_id) {
                snapshot.devices.insert(device.id.clone(), Arc::new(device));
                devices += 1;
            }
        }

        let hubs = next.len();
        *self.hubs.write() = next.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        (hubs, devices)
    }

    /// Insert or update a hub, keeping its devices. Returns `true` if new.
    pub fn upsert_hub(&self, raw: &RawHub) -> bool {
        let hub = self.builder.build_hub(raw);
        let mut hubs = self.hubs.write();
        match hubs.get(&hub.id) {
            Some(existing) => {
                let next = HubSnapshot {
                    hub,
                    devices: existing.devices.clone(),
                };
                hubs.insert(next.hub.id.clone(), Arc::new(next));
                false
            }
            None => {
                hubs.insert(
                    hub.id.clone(),
                    Arc::new(HubSnapshot {
                        hub,
                        devices: BTreeMap::new(),
                    }),
                );
                true
            }
        }
    }

    /// Remove a hub and, with it, all of its devices.
    pub fn remove_hub(&self, hub_id: &str) -> Option<Arc<HubSnapshot>> {
        self.hubs.write().remove(hub_id)
    }

    pub fn set_hub_online(&self, hub_id: &str, online: bool) -> bool {
        self.update_hub(hub_id, |snapshot| {
            if snapshot.hub.online == online {
                return false;
            }
            snapshot.hub.online = online;
            true
        })
    }

    /// Insert or rebuild a device. `None` when its hub is unknown.
    pub fn upsert_device(&self, raw: &RawDevice) -> Option<Arc<Device>> {
        let device = Arc::new(self.builder.apply(raw));
        let inserted = Arc::clone(&device);
        self.update_hub(&raw.agt, move |snapshot| {
            snapshot.devices.insert(device.id.clone(), device);
            true
        })
        .then_some(inserted)
    }

    pub fn remove_device(&self, hub_id: &str, device_id: &str) -> Option<Arc<Device>> {
        let mut removed = None;
        self.update_hub(hub_id, |snapshot| {
            removed = snapshot.devices.remove(device_id);
            removed.is_some()
        });
        removed
    }

    /// Apply one IO change. `None` when the hub or device is unknown.
    pub fn apply_delta(&self, delta: &IoDelta) -> Option<DeltaOutcome> {
        let mut outcome = None;
        self.update_device(&delta.hub_id, &delta.device_id, |device| {
            let before = device.role;
            let io = self.builder.apply_delta(device, delta);
            outcome = Some(DeltaOutcome {
                io,
                role_changed: (device.role != before).then_some(device.role),
            });
            true
        });
        outcome
    }

    pub fn set_device_online(&self, hub_id: &str, device_id: &str, online: bool) -> bool {
        self.update_device(hub_id, device_id, |device| {
            if device.online == online {
                return false;
            }
            device.online = online;
            true
        })
    }

    pub fn rename_device(&self, hub_id: &str, device_id: &str, name: &str) -> bool {
        self.update_device(hub_id, device_id, |device| {
            if device.name == name {
                return false;
            }
            device.name = name.to_string();
            true
        })
    }

    pub fn rename_io(&self, hub_id: &str, device_id: &str, io_key: &str, name: &str) -> bool {
        self.update_device(hub_id, device_id, |device| match device.ios.get_mut(io_key) {
            Some(io) if io.name.as_deref() != Some(name) => {
                io.name = Some(name.to_string());
                true
            }
            _ => false,
        })
    }

    pub fn hub(&self, hub_id: &str) -> Option<Arc<HubSnapshot>> {
        self.hubs.read().get(hub_id).cloned()
    }

    /// All hubs, ordered by id.
    pub fn hubs(&self) -> Vec<Arc<HubSnapshot>> {
        let mut hubs: Vec<_> = self.hubs.read().values().cloned().collect();
        hubs.sort_by(|a, b| a.hub.id.cmp(&b.hub.id));
        hubs
    }

    pub fn device(&self, hub_id: &str, device_id: &str) -> Option<Arc<Device>> {
        self.hubs.read().get(hub_id)?.devices.get(device_id).cloned()
    }

    /// All devices, ordered by hub then device id.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.hubs()
            .iter()
            .flat_map(|h| h.devices.values().cloned())
            .collect()
    }

    pub fn io(&self, hub_id: &str, device_id: &str, io_key: &str) -> Option<IoState> {
        self.device(hub_id, device_id)?.ios.get(io_key).cloned()
    }

    /// `(total, online)` hub counts.
    pub fn hub_counts(&self) -> (usize, usize) {
        let hubs = self.hubs.read();
        let online = hubs.values().filter(|h| h.hub.online).count();
        (hubs.len(), online)
    }

    pub fn device_count(&self) -> usize {
        self.hubs.read().values().map(|h| h.devices.len()).sum()
    }

    /// Copy-on-write update of one hub. `f` returns whether it changed
    /// anything; unchanged snapshots are not replaced.
    fn update_hub<F>(&self, hub_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut HubSnapshot) -> bool,
    {
        let mut hubs = self.hubs.write();
        let Some(current) = hubs.get(hub_id) else {
            return false;
        };
        let mut next = HubSnapshot::clone(current);
        if !f(&mut next) {
            return false;
        }
        hubs.insert(hub_id.to_string(), Arc::new(next));
        true
    }

    fn update_device<F>(&self, hub_id: &str, device_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Device) -> bool,
    {
        self.update_hub(hub_id, |snapshot| {
            let Some(current) = snapshot.devices.get(device_id) else {
                return false;
            };
            let mut device = Device::clone(current);
            if !f(&mut device) {
                return false;
            }
            snapshot.devices.insert(device_id.to_string(), Arc::new(device));
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingRegistry;
    use crate::payload::RawIo;
    use serde_json::json;

    fn store() -> DeviceStore {
        DeviceStore::new(DeviceModelBuilder::with_registry(MappingRegistry::builtin()))
    }

    fn snapshot() -> RawSnapshot {
        serde_json::from_value(json!({
            "hubs": [{ "agt": "A1", "name": "Home" }, { "agt": "A2", "stat": 0 }],
            "devices": [
                { "agt": "A1", "me": "d1", "devtype": "SL_SW_IF3",
                  "data": { "L1": { "type": 128, "val": 0 } } },
                { "agt": "A2", "me": "d2", "devtype": "SL_SC_G" },
                { "agt": "ZZ", "me": "orphan", "devtype": "SL_SC_G" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_replace_all_drops_orphans() {
        let store = store();
        assert_eq!(store.replace_all(&snapshot()), (2, 2));
        assert_eq!(store.hub_counts(), (2, 1));
        assert!(store.device("ZZ", "orphan").is_none());
    }

    #[test]
    fn test_readers_keep_old_snapshot() {
        let store = store();
        store.replace_all(&snapshot());
        let before = store.device("A1", "d1").unwrap();

        store.apply_delta(&IoDelta::new("A1", "d1", "L1", RawIo::new(129, 1)));

        assert!(!before.io("L1").unwrap().is_on());
        assert!(store.io("A1", "d1", "L1").unwrap().is_on());
    }

    #[test]
    fn test_delta_for_unknown_device() {
        let store = store();
        store.replace_all(&snapshot());
        assert!(store
            .apply_delta(&IoDelta::new("A1", "nope", "L1", RawIo::new(129, 1)))
            .is_none());
    }

    #[test]
    fn test_remove_hub_cascades() {
        let store = store();
        store.replace_all(&snapshot());
        let removed = store.remove_hub("A1").unwrap();
        assert_eq!(removed.devices.len(), 1);
        assert!(store.device("A1", "d1").is_none());
        assert_eq!(store.device_count(), 1);
    }

    #[test]
    fn test_upsert_device_needs_hub() {
        let store = store();
        store.replace_all(&snapshot());
        let raw: RawDevice =
            serde_json::from_value(json!({ "agt": "A9", "me": "x", "devtype": "SL_SC_G" })).unwrap();
        assert!(store.upsert_device(&raw).is_none());

        let raw: RawDevice =
            serde_json::from_value(json!({ "agt": "A1", "me": "x", "devtype": "SL_SC_G" })).unwrap();
        assert!(store.upsert_device(&raw).is_some());
        assert!(store.device("A1", "x").is_some());
    }

    #[test]
    fn test_renames_and_online() {
        let store = store();
        store.replace_all(&snapshot());
        assert!(store.rename_device("A1", "d1", "Hall"));
        assert!(!store.rename_device("A1", "d1", "Hall"));
        assert!(store.rename_io("A1", "d1", "L1", "Left"));
        assert!(!store.rename_io("A1", "d1", "L9", "Left"));
        assert!(store.set_device_online("A1", "d1", false));
        assert!(store.set_hub_online("A2", true));
        assert_eq!(store.hub_counts(), (2, 2));

        let dev = store.device("A1", "d1").unwrap();
        assert_eq!(dev.name, "Hall");
        assert_eq!(dev.io("L1").unwrap().name.as_deref(), Some("Left"));
        assert!(!dev.online);
    }

    #[test]
    fn test_upsert_hub_keeps_devices() {
        let store = store();
        store.replace_all(&snapshot());
        let is_new = store.upsert_hub(&RawHub {
            agt: "A1".into(),
            name: "Renamed".into(),
            agt_ver: None,
            stat: 1,
            mode: None,
        });
        assert!(!is_new);
        assert_eq!(store.hub("A1").unwrap().devices.len(), 1);
        assert_eq!(store.hub("A1").unwrap().hub.name, "Renamed");
    }
}
