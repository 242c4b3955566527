//! Device model builder.
//!
//! Turns raw payloads into typed [`Device`]s using the mapping registry. All
//! functions are pure with respect to their inputs and the registry in
//! effect; conversion problems are recorded on the IO and logged, never
//! returned as errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::classify::classify;
use crate::mapping::{DeviceTypeMapping, FriendlyValue, MappingEntry, MappingRegistry, SharedRegistry};
use crate::model::{ConnectionMode, Device, Hub, IoState, IoStatus, RawValue};
use crate::payload::{json_i64, IoDelta, RawDevice, RawHub, RawIo, RawSnapshot};

/// Hubs and devices built from one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltSnapshot {
    pub hubs: Vec<Hub>,
    pub devices: Vec<Device>,
}

/// Builds devices and IO states from wire payloads.
#[derive(Debug, Clone)]
pub struct DeviceModelBuilder {
    registry: Arc<SharedRegistry>,
}

impl DeviceModelBuilder {
    pub fn new(registry: Arc<SharedRegistry>) -> Self {
        Self { registry }
    }

    pub fn with_registry(registry: MappingRegistry) -> Self {
        Self::new(Arc::new(SharedRegistry::new(registry)))
    }

    pub fn shared_registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    /// Registry in effect for the next build.
    pub fn registry(&self) -> Arc<MappingRegistry> {
        self.registry.current()
    }

    pub fn build_hub(&self, raw: &RawHub) -> Hub {
        Hub {
            id: raw.agt.clone(),
            name: raw.name.clone(),
            firmware: raw.agt_ver.clone(),
            online: raw.stat != 0,
            mode: match raw.mode.as_deref() {
                Some("local") => ConnectionMode::Local,
                _ => ConnectionMode::Cloud,
            },
        }
    }

    /// Full rebuild of one device.
    pub fn apply(&self, raw: &RawDevice) -> Device {
        let registry = self.registry();
        let mapping = registry.device_type(&raw.devtype);

        let ios: BTreeMap<String, IoState> = raw
            .data
            .iter()
            .map(|(key, io)| {
                let state = build_io(mapping, &raw.devtype, key, io, None);
                (key.clone(), state)
            })
            .collect();

        Device {
            hub_id: raw.agt.clone(),
            id: raw.me.clone(),
            device_type: raw.devtype.clone(),
            full_type: raw.full_cls.clone().unwrap_or_else(|| raw.devtype.clone()),
            name: raw.name.clone(),
            online: raw.stat != 0,
            role: classify(mapping, &ios),
            ios,
        }
    }

    /// Full rebuild of every hub and device in a snapshot.
    pub fn apply_snapshot(&self, raw: &RawSnapshot) -> BuiltSnapshot {
        BuiltSnapshot {
            hubs: raw.hubs.iter().map(|h| self.build_hub(h)).collect(),
            devices: raw.devices.iter().map(|d| self.apply(d)).collect(),
        }
    }

    /// Apply one IO change to `device` and return the new IO state.
    ///
    /// Unknown keys are added. A delta without a name keeps the IO's
    /// existing display name. The device role is re-evaluated.
    pub fn apply_delta(&self, device: &mut Device, delta: &IoDelta) -> IoState {
        let registry = self.registry();
        let mapping = registry.device_type(&device.device_type);
        let previous_name = device.ios.get(&delta.io_key).and_then(|io| io.name.clone());

        let state = build_io(
            mapping,
            &device.device_type,
            &delta.io_key,
            &delta.io,
            previous_name,
        );
        device.ios.insert(delta.io_key.clone(), state.clone());
        device.role = classify(mapping, &device.ios);
        state
    }
}

fn build_io(
    mapping: Option<&DeviceTypeMapping>,
    device_type: &str,
    key: &str,
    raw: &RawIo,
    previous_name: Option<String>,
) -> IoState {
    let raw_type = json_i64(&raw.raw_type);
    let raw_val = match json_i64(&raw.val) {
        Some(i) => RawValue::Int(i),
        None => RawValue::Other(raw.val.clone()),
    };

    let mut state = IoState {
        key: key.to_string(),
        raw_type: raw_type.unwrap_or(0),
        raw_type_wire: raw_type.is_none().then(|| raw.raw_type.clone()),
        raw_val,
        friendly: None,
        name: raw.name.clone().or(previous_name),
        status: IoStatus::Unmapped,
        role: None,
        unit: None,
        state_class: None,
        warning: None,
    };

    let Some(entry) = mapping.and_then(|m| m.resolve(key)) else {
        return state;
    };
    state.role = Some(entry.role);
    state.unit = entry.unit.clone();
    state.state_class = entry.state_class;

    match convert_io(entry, raw_type, &raw.raw_type, &state.raw_val, raw.v.as_ref()) {
        Ok(friendly) => {
            state.friendly = Some(friendly);
            state.status = IoStatus::Mapped;
        }
        Err(reason) => {
            warn!(
                category = "mapping",
                device_type = %device_type,
                io = %key,
                reason = %reason,
                "IO value not converted"
            );
            state.status = IoStatus::Unconverted;
            state.warning = Some(reason);
        }
    }
    state
}

fn convert_io(
    entry: &MappingEntry,
    raw_type: Option<i64>,
    wire_type: &Value,
    raw_val: &RawValue,
    wire_v: Option<&Value>,
) -> Result<FriendlyValue, String> {
    if let Some(v) = wire_v.and_then(FriendlyValue::from_json) {
        return Ok(v);
    }

    let raw_type = raw_type.ok_or_else(|| format!("raw type is not an integer: {}", wire_type))?;
    let raw_val = match raw_val.as_i64() {
        Some(v) => v,
        None if entry.rule.needs_value() => {
            return Err(format!("raw value is not an integer: {}", raw_value_text(raw_val)));
        }
        None => 0,
    };

    entry
        .rule
        .convert(raw_type, raw_val)
        .ok_or_else(|| format!("rule {} has no value for {}", entry.rule, raw_val))
}

fn raw_value_text(raw: &RawValue) -> String {
    match raw {
        RawValue::Int(i) => i.to_string(),
        RawValue::Other(v) => v.to_string(),
    }
}
