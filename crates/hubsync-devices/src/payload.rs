//! Wire payload shapes for snapshots and IO deltas.
//!
//! Field names follow the vendor JSON. Everything optional on the wire is
//! defaulted so a sparse payload still deserializes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_online() -> i64 {
    1
}

/// One IO as it appears in a device's `data` map or in an `io` push event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawIo {
    #[serde(rename = "type", default)]
    pub raw_type: Value,
    #[serde(default)]
    pub val: Value,
    /// Friendly value computed by the server. Authoritative when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RawIo {
    pub fn new(raw_type: i64, val: i64) -> Self {
        Self {
            raw_type: Value::from(raw_type),
            val: Value::from(val),
            v: None,
            name: None,
        }
    }
}

/// A device entry of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDevice {
    /// Hub id.
    pub agt: String,
    /// Device id.
    pub me: String,
    pub devtype: String,
    #[serde(rename = "fullCls", default, skip_serializing_if = "Option::is_none")]
    pub full_cls: Option<String>,
    #[serde(default)]
    pub name: String,
    /// 1 online, 0 offline.
    #[serde(default = "default_online")]
    pub stat: i64,
    #[serde(default)]
    pub data: BTreeMap<String, RawIo>,
}

/// A hub entry of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHub {
    pub agt: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agt_ver: Option<String>,
    #[serde(default = "default_online")]
    pub stat: i64,
    /// `"local"` for hubs reached over the LAN socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Full hub/device tree returned by a snapshot fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    #[serde(default)]
    pub hubs: Vec<RawHub>,
    #[serde(default)]
    pub devices: Vec<RawDevice>,
}

/// Incremental change to one IO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoDelta {
    pub hub_id: String,
    pub device_id: String,
    pub io_key: String,
    #[serde(flatten)]
    pub io: RawIo,
}

impl IoDelta {
    pub fn new(
        hub_id: impl Into<String>,
        device_id: impl Into<String>,
        io_key: impl Into<String>,
        io: RawIo,
    ) -> Self {
        Self {
            hub_id: hub_id.into(),
            device_id: device_id.into(),
            io_key: io_key.into(),
            io,
        }
    }
}

/// Integer from a JSON number or numeric string.
pub(crate) fn json_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sparse_device() {
        let dev: RawDevice = serde_json::from_value(json!({
            "agt": "A1", "me": "2d11", "devtype": "SL_SC_THL",
            "data": { "T": { "type": 95, "val": 234, "v": 23.4 } }
        }))
        .unwrap();
        assert_eq!(dev.stat, 1);
        assert_eq!(dev.full_cls, None);
        assert_eq!(dev.data["T"].v, Some(json!(23.4)));
    }

    #[test]
    fn test_json_i64() {
        assert_eq!(json_i64(&json!(462)), Some(462));
        assert_eq!(json_i64(&json!(12.0)), Some(12));
        assert_eq!(json_i64(&json!("17")), Some(17));
        assert_eq!(json_i64(&json!(1.5)), None);
        assert_eq!(json_i64(&json!("abc")), None);
        assert_eq!(json_i64(&json!(null)), None);
    }
}
