//! Push stream frames.
//!
//! Inbound frames are `{seq, category, body}`; the body schema depends on the
//! category. Outbound frames (login, subscribe, ping) use the same envelope
//! without a sequence id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use hubsync_core::{Error, Result};
use hubsync_devices::{AuditRecord, IoDelta, RawDevice, RawHub, RawIo};

/// Frame categories.
pub mod categories {
    pub const IO: &str = "io";
    pub const DEVICE_ONLINE: &str = "ep.online";
    pub const DEVICE_ADDED: &str = "ep.add";
    pub const DEVICE_REMOVED: &str = "ep.del";
    pub const HUB_ADDED: &str = "agt.add";
    pub const HUB_REMOVED: &str = "agt.del";
    pub const HUB_ONLINE: &str = "agt.online";
    pub const HUB_REBOOTED: &str = "agt.reboot";
    pub const NAME: &str = "name";
    pub const IO_NAME: &str = "io.name";
    pub const SCENE: &str = "scene";
    pub const AUDIT: &str = "audit";
    pub const FULL_SYNC: &str = "fullsync";
    pub const AUTH: &str = "auth";
    pub const AUTH_OK: &str = "auth.ok";
    pub const AUTH_FAIL: &str = "auth.fail";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIBE_OK: &str = "subscribe.ok";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// Raw stream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub category: String,
    #[serde(default)]
    pub body: Value,
}

/// Decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Io(IoDelta),
    DeviceOnline {
        hub_id: String,
        device_id: String,
        online: bool,
    },
    DeviceAdded(RawDevice),
    DeviceRemoved {
        hub_id: String,
        device_id: String,
    },
    HubAdded(RawHub),
    HubRemoved {
        hub_id: String,
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
    Scene {
        hub_id: String,
        scene_id: String,
        name: Option<String>,
        active: bool,
    },
    Audit(AuditRecord),
    FullSync,
    AuthOk,
    AuthFailed {
        code: i64,
        message: String,
    },
    Subscribed,
    Pong,
    Unknown {
        category: String,
    },
}

impl StreamEvent {
    /// Whether applying this event mutates the device store.
    pub fn mutates_store(&self) -> bool {
        matches!(
            self,
            StreamEvent::Io(_)
                | StreamEvent::DeviceOnline { .. }
                | StreamEvent::DeviceAdded(_)
                | StreamEvent::DeviceRemoved { .. }
                | StreamEvent::HubAdded(_)
                | StreamEvent::HubRemoved { .. }
                | StreamEvent::HubOnline { .. }
                | StreamEvent::NameChanged { .. }
                | StreamEvent::IoNameChanged { .. }
        )
    }
}

#[derive(Deserialize)]
struct IoBody {
    agt: String,
    me: String,
    idx: String,
    #[serde(flatten)]
    io: RawIo,
}

#[derive(Deserialize)]
struct DeviceRef {
    agt: String,
    me: String,
}

#[derive(Deserialize)]
struct HubRef {
    agt: String,
}

#[derive(Deserialize)]
struct OnlineBody {
    agt: String,
    #[serde(default)]
    me: Option<String>,
    stat: i64,
}

#[derive(Deserialize)]
struct NameBody {
    agt: String,
    me: String,
    #[serde(default)]
    idx: Option<String>,
    name: String,
}

#[derive(Deserialize)]
struct SceneBody {
    agt: String,
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    active: i64,
}

#[derive(Deserialize)]
struct AuditBody {
    agt: String,
    #[serde(rename = "cat")]
    category: String,
    #[serde(rename = "cls")]
    class: String,
    #[serde(default)]
    level: i64,
    #[serde(default, rename = "obj")]
    object: String,
    #[serde(default)]
    zone: String,
    #[serde(default, rename = "msg")]
    message: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Deserialize)]
struct AuthFailBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

fn body<T: serde::de::DeserializeOwned>(category: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Serialization(format!("malformed '{}' frame: {}", category, e)))
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn new(category: &str, body: Value) -> Self {
        Self {
            seq: None,
            category: category.to_string(),
            body,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the body according to the category.
    pub fn decode(self) -> Result<StreamEvent> {
        use categories::*;

        let category = self.category.as_str();
        let event = match category {
            IO => {
                let b: IoBody = body(category, self.body)?;
                StreamEvent::Io(IoDelta::new(b.agt, b.me, b.idx, b.io))
            }
            DEVICE_ONLINE => {
                let b: OnlineBody = body(category, self.body)?;
                let device_id = b
                    .me
                    .ok_or_else(|| Error::Serialization("ep.online frame without 'me'".into()))?;
                StreamEvent::DeviceOnline {
                    hub_id: b.agt,
                    device_id,
                    online: b.stat != 0,
                }
            }
            DEVICE_ADDED => StreamEvent::DeviceAdded(body(category, self.body)?),
            DEVICE_REMOVED => {
                let b: DeviceRef = body(category, self.body)?;
                StreamEvent::DeviceRemoved {
                    hub_id: b.agt,
                    device_id: b.me,
                }
            }
            HUB_ADDED => StreamEvent::HubAdded(body(category, self.body)?),
            HUB_REMOVED => StreamEvent::HubRemoved {
                hub_id: body::<HubRef>(category, self.body)?.agt,
            },
            HUB_ONLINE => {
                let b: OnlineBody = body(category, self.body)?;
                StreamEvent::HubOnline {
                    hub_id: b.agt,
                    online: b.stat != 0,
                }
            }
            HUB_REBOOTED => StreamEvent::HubRebooted {
                hub_id: body::<HubRef>(category, self.body)?.agt,
            },
            NAME => {
                let b: NameBody = body(category, self.body)?;
                StreamEvent::NameChanged {
                    hub_id: b.agt,
                    device_id: b.me,
                    name: b.name,
                }
            }
            IO_NAME => {
                let b: NameBody = body(category, self.body)?;
                let io_key = b
                    .idx
                    .ok_or_else(|| Error::Serialization("io.name frame without 'idx'".into()))?;
                StreamEvent::IoNameChanged {
                    hub_id: b.agt,
                    device_id: b.me,
                    io_key,
                    name: b.name,
                }
            }
            SCENE => {
                let b: SceneBody = body(category, self.body)?;
                StreamEvent::Scene {
                    hub_id: b.agt,
                    scene_id: b.id,
                    name: b.name,
                    active: b.active != 0,
                }
            }
            AUDIT => {
                let b: AuditBody = body(category, self.body)?;
                StreamEvent::Audit(AuditRecord {
                    hub_id: b.agt,
                    category: b.category,
                    class: b.class,
                    level: b.level,
                    object: b.object,
                    zone: b.zone,
                    message: b.message,
                    ts: b.ts,
                })
            }
            FULL_SYNC => StreamEvent::FullSync,
            AUTH_OK => StreamEvent::AuthOk,
            AUTH_FAIL => {
                let b: AuthFailBody = body(category, self.body)?;
                StreamEvent::AuthFailed {
                    code: b.code,
                    message: b.message,
                }
            }
            SUBSCRIBE_OK => StreamEvent::Subscribed,
            PONG => StreamEvent::Pong,
            other => StreamEvent::Unknown {
                category: other.to_string(),
            },
        };
        Ok(event)
    }
}

/// Subscribe to every event of the account.
pub fn subscribe_frame() -> Envelope {
    Envelope::new(categories::SUBSCRIBE, json!({ "scope": "all" }))
}

pub fn ping_frame() -> Envelope {
    Envelope::new(categories::PING, Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(value: Value) -> StreamEvent {
        serde_json::from_value::<Envelope>(value).unwrap().decode().unwrap()
    }

    #[test]
    fn test_io_frame() {
        let event = decode(json!({
            "seq": 7,
            "category": "io",
            "body": { "agt": "A1", "me": "2d11", "idx": "H", "type": 95, "val": 462, "v": 46.2 }
        }));
        match event {
            StreamEvent::Io(delta) => {
                assert_eq!(delta.io_key, "H");
                assert_eq!(delta.io.v, Some(json!(46.2)));
                assert_eq!(delta.io.val, json!(462));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_audit_frame_keeps_own_schema() {
        let event = decode(json!({
            "seq": 8,
            "category": "audit",
            "body": { "agt": "A1", "cat": "security", "cls": "intrusion", "level": 3,
                      "obj": "door", "zone": "hall", "ts": 1700000000 }
        }));
        match event {
            StreamEvent::Audit(record) => {
                assert_eq!(record.class, "intrusion");
                assert_eq!(record.zone, "hall");
                assert_eq!(record.level, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!decode(json!({ "category": "audit", "body": { "agt": "A1", "cat": "c", "cls": "x" } })).mutates_store());
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(decode(json!({ "category": "fullsync" })), StreamEvent::FullSync);
        assert_eq!(decode(json!({ "category": "auth.ok" })), StreamEvent::AuthOk);
        assert_eq!(
            decode(json!({ "category": "auth.fail", "body": { "code": 10004, "message": "sign" } })),
            StreamEvent::AuthFailed { code: 10004, message: "sign".into() }
        );
        assert_eq!(
            decode(json!({ "category": "weather" })),
            StreamEvent::Unknown { category: "weather".into() }
        );
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        let envelope: Envelope = serde_json::from_value(json!({ "category": "io", "body": { "agt": "A1" } })).unwrap();
        assert!(envelope.decode().is_err());
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_outbound_frames_have_no_seq() {
        let text = subscribe_frame().to_text().unwrap();
        assert!(!text.contains("seq"));
        assert!(text.contains("\"subscribe\""));
    }
}
