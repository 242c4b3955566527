//! Normalized change events published to the host.

use serde::{Deserialize, Serialize};

use hubsync_core::EventBus;

use crate::mapping::DeviceRole;
use crate::model::IoState;

/// Structured security/audit log record. Kept apart from IO changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub hub_id: String,
    pub category: String,
    pub class: String,
    pub level: i64,
    pub object: String,
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Server timestamp, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

/// Why the device tree was rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    Connected,
    FullSync,
    SequenceGap,
    UnknownDevice,
    Requested,
}

/// Every change the bridge surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    IoChanged {
        hub_id: String,
        device_id: String,
        io: IoState,
        /// Set when the change flipped the device's classified role.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<DeviceRole>,
        /// Applied from an acknowledged write before the push confirmed it.
        #[serde(default)]
        optimistic: bool,
    },
    DeviceOnline {
        hub_id: String,
        device_id: String,
        online: bool,
    },
    DeviceAdded {
        hub_id: String,
        device_id: String,
        device_type: String,
    },
    DeviceRemoved {
        hub_id: String,
        device_id: String,
    },
    HubAdded {
        hub_id: String,
    },
    HubRemoved {
        hub_id: String,
        devices_removed: usize,
    },
    HubOnline {
        hub_id: String,
        online: bool,
    },
    HubRebooted {
        hub_id: String,
    },
    NameChanged {
        hub_id: String,
        device_id: String,
        name: String,
    },
    IoNameChanged {
        hub_id: String,
        device_id: String,
        io_key: String,
        name: String,
    },
    SceneChanged {
        hub_id: String,
        scene_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        active: bool,
    },
    Audit(AuditRecord),
    Resynced {
        reason: ResyncReason,
        hubs: usize,
        devices: usize,
    },
    ConnectionChanged {
        connected: bool,
    },
}

impl DeviceEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceEvent::IoChanged { .. } => "io_changed",
            DeviceEvent::DeviceOnline { .. } => "device_online",
            DeviceEvent::DeviceAdded { .. } => "device_added",
            DeviceEvent::DeviceRemoved { .. } => "device_removed",
            DeviceEvent::HubAdded { .. } => "hub_added",
            DeviceEvent::HubRemoved { .. } => "hub_removed",
            DeviceEvent::HubOnline { .. } => "hub_online",
            DeviceEvent::HubRebooted { .. } => "hub_rebooted",
            DeviceEvent::NameChanged { .. } => "name_changed",
            DeviceEvent::IoNameChanged { .. } => "io_name_changed",
            DeviceEvent::SceneChanged { .. } => "scene_changed",
            DeviceEvent::Audit(_) => "audit",
            DeviceEvent::Resynced { .. } => "resynced",
            DeviceEvent::ConnectionChanged { .. } => "connection_changed",
        }
    }

    pub fn hub_id(&self) -> Option<&str> {
        match self {
            DeviceEvent::IoChanged { hub_id, .. }
            | DeviceEvent::DeviceOnline { hub_id, .. }
            | DeviceEvent::DeviceAdded { hub_id, .. }
            | DeviceEvent::DeviceRemoved { hub_id, .. }
            | DeviceEvent::HubAdded { hub_id }
            | DeviceEvent::HubRemoved { hub_id, .. }
            | DeviceEvent::HubOnline { hub_id, .. }
            | DeviceEvent::HubRebooted { hub_id }
            | DeviceEvent::NameChanged { hub_id, .. }
            | DeviceEvent::IoNameChanged { hub_id, .. }
            | DeviceEvent::SceneChanged { hub_id, .. } => Some(hub_id),
            DeviceEvent::Audit(record) => Some(&record.hub_id),
            DeviceEvent::Resynced { .. } | DeviceEvent::ConnectionChanged { .. } => None,
        }
    }
}

/// Event bus carrying [`DeviceEvent`]s.
pub type DeviceEventBus = EventBus<DeviceEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_serializes_with_own_schema() {
        let event = DeviceEvent::Audit(AuditRecord {
            hub_id: "A1".into(),
            category: "security".into(),
            class: "alarm".into(),
            level: 2,
            object: "door".into(),
            zone: "hall".into(),
            message: None,
            ts: Some(1_700_000_000),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "audit");
        assert_eq!(json["zone"], "hall");
        assert!(json.get("io").is_none());
        assert_eq!(event.hub_id(), Some("A1"));
    }
}
