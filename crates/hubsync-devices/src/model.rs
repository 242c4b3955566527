//! Typed hub / device / IO model.
//!
//! The model holds no timestamps so that rebuilding from the same payload
//! yields an equal value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mapping::{DeviceRole, FriendlyValue, SemanticRole, StateClass};
use crate::raw_type::RawType;

/// How the bridge reaches a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Cloud,
    Local,
}

/// A physical gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hub {
    pub id: String,
    pub name: String,
    pub firmware: Option<String>,
    pub online: bool,
    pub mode: ConnectionMode,
}

/// Raw IO value as received. Almost always an integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Int(i64),
    Other(serde_json::Value),
}

impl RawValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Int(i) => Some(*i),
            RawValue::Other(_) => None,
        }
    }
}

impl Default for RawValue {
    fn default() -> Self {
        RawValue::Other(serde_json::Value::Null)
    }
}

/// How far interpretation of an IO got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoStatus {
    /// Registry entry found and a friendly value produced.
    Mapped,
    /// No registry entry; raw fields only.
    Unmapped,
    /// Registry entry found but the payload could not be converted.
    Unconverted,
}

/// One addressable attribute of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoState {
    pub key: String,
    /// Decoded type bits; `0` when the wire `type` was not an integer.
    pub raw_type: i64,
    /// The wire `type` as received, kept only when it was not an integer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_type_wire: Option<serde_json::Value>,
    pub raw_val: RawValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly: Option<FriendlyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: IoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<SemanticRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<StateClass>,
    /// Why conversion failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl IoState {
    pub fn decoded_type(&self) -> RawType {
        RawType::decode(self.raw_type)
    }

    pub fn is_on(&self) -> bool {
        self.decoded_type().on
    }
}

/// A child endpoint of one hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub hub_id: String,
    pub id: String,
    pub device_type: String,
    /// Versioned type identifier, e.g. `SL_SC_THL_V2`.
    pub full_type: String,
    pub name: String,
    pub online: bool,
    pub role: DeviceRole,
    pub ios: BTreeMap<String, IoState>,
}

impl Device {
    pub fn io(&self, key: &str) -> Option<&IoState> {
        self.ios.get(key)
    }
}
