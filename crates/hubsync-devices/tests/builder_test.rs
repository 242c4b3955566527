//! Device model builder tests.
//!
//! Covers rebuild idempotence, delta ordering, dynamic classification and the
//! wire formats of the metering and climate sensors.

use serde_json::json;

use hubsync_devices::{
    DeviceModelBuilder, DeviceRole, DeviceStore, FriendlyValue, IoDelta, IoStatus,
    MappingRegistry, RawDevice, RawIo, RawSnapshot,
};

/// Helper to create a builder over the built-in table.
fn create_builder() -> DeviceModelBuilder {
    DeviceModelBuilder::with_registry(MappingRegistry::builtin())
}

fn raw_device(devtype: &str, data: serde_json::Value) -> RawDevice {
    serde_json::from_value(json!({
        "agt": "A3EAAABtAEwQRzMyNzY4Ng",
        "me": "2d11",
        "devtype": devtype,
        "fullCls": format!("{}_V1", devtype),
        "name": "Living room",
        "stat": 1,
        "data": data
    }))
    .unwrap()
}

fn delta(key: &str, raw_type: i64, val: i64) -> IoDelta {
    IoDelta::new("A3EAAABtAEwQRzMyNzY4Ng", "2d11", key, RawIo::new(raw_type, val))
}

#[test]
fn test_full_rebuild_is_idempotent() {
    let builder = create_builder();
    let raw = raw_device(
        "SL_OE_DE",
        json!({
            "P1": { "type": 129, "val": 1, "name": "Relay" },
            "EE": { "type": 8, "val": 1024913643 },
            "EP": { "type": 8, "val": 1130774528 },
            "ZZ": { "type": 3, "val": "garbage" }
        }),
    );

    let first = builder.apply(&raw);
    let second = builder.apply(&raw);
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[test]
fn test_snapshot_idempotent_through_store() {
    let store = DeviceStore::new(create_builder());
    let raw: RawSnapshot = serde_json::from_value(json!({
        "hubs": [{ "agt": "A3EAAABtAEwQRzMyNzY4Ng", "name": "Home", "agt_ver": "1.0.9" }],
        "devices": [{
            "agt": "A3EAAABtAEwQRzMyNzY4Ng", "me": "2d11", "devtype": "SL_SC_THL",
            "data": { "T": { "type": 95, "val": 231, "v": 23.1 } }
        }]
    }))
    .unwrap();

    store.replace_all(&raw);
    let first: Vec<_> = store.devices().iter().map(|d| (**d).clone()).collect();
    store.replace_all(&raw);
    let second: Vec<_> = store.devices().iter().map(|d| (**d).clone()).collect();
    assert_eq!(first, second);
}

#[test]
fn test_energy_bit_pattern() {
    let device = create_builder().apply(&raw_device(
        "SL_OE_DE",
        json!({ "EE": { "type": 8, "val": 1024913643 } }),
    ));
    let ee = device.io("EE").unwrap();
    assert_eq!(ee.status, IoStatus::Mapped);
    assert_eq!(ee.unit.as_deref(), Some("kWh"));
    let value = ee.friendly.unwrap().as_f64();
    assert!((value - 0.036_850_85).abs() < 1e-8, "got {}", value);
}

#[test]
fn test_humidity_uses_wire_value() {
    let device = create_builder().apply(&raw_device(
        "SL_SC_THL",
        json!({ "H": { "type": 95, "val": 462, "v": 46.2 } }),
    ));
    assert_eq!(device.io("H").unwrap().friendly, Some(FriendlyValue::Float(46.2)));
}

#[test]
fn test_last_write_wins_per_io() {
    let builder = create_builder();
    let raw = raw_device("SL_SW_IF3", json!({ "L1": { "type": 128, "val": 0 } }));

    let mut twice = builder.apply(&raw);
    builder.apply_delta(&mut twice, &delta("L1", 129, 1));
    builder.apply_delta(&mut twice, &delta("L1", 128, 0));

    let mut once = builder.apply(&raw);
    builder.apply_delta(&mut once, &delta("L1", 128, 0));

    assert_eq!(twice, once);
}

#[test]
fn test_classification_follows_selector_only() {
    let builder = create_builder();
    let mut device = builder.apply(&raw_device(
        "SL_NATURE",
        json!({ "P1": { "type": 129, "val": 1 } }),
    ));
    assert_eq!(device.role, DeviceRole::Undetermined);

    builder.apply_delta(&mut device, &delta("P5", 0, 1));
    assert_eq!(device.role, DeviceRole::Switch);

    // Non-selector changes never move the role.
    builder.apply_delta(&mut device, &delta("P1", 128, 0));
    builder.apply_delta(&mut device, &delta("P4", 0, 215));
    assert_eq!(device.role, DeviceRole::Switch);

    builder.apply_delta(&mut device, &delta("P5", 0, 3));
    assert_eq!(device.role, DeviceRole::Climate);
}

#[test]
fn test_role_change_reported_by_store() {
    let store = DeviceStore::new(create_builder());
    store.replace_all(
        &serde_json::from_value(json!({
            "hubs": [{ "agt": "A3EAAABtAEwQRzMyNzY4Ng" }],
            "devices": [{ "agt": "A3EAAABtAEwQRzMyNzY4Ng", "me": "2d11", "devtype": "SL_P",
                          "data": { "P1": { "type": 0, "val": 0x0800_0000 } } }]
        }))
        .unwrap(),
    );
    assert_eq!(store.device("A3EAAABtAEwQRzMyNzY4Ng", "2d11").unwrap().role, DeviceRole::Switch);

    let unchanged = store.apply_delta(&delta("P2", 129, 1)).unwrap();
    assert_eq!(unchanged.role_changed, None);

    let changed = store.apply_delta(&delta("P1", 0, 0x0200_0000)).unwrap();
    assert_eq!(changed.role_changed, Some(DeviceRole::Cover));
}

#[test]
fn test_unknown_device_type_is_raw_only() {
    let device = create_builder().apply(&raw_device(
        "SL_FUTURE_X",
        json!({ "P1": { "type": 129, "val": 7, "v": 0.7 } }),
    ));
    assert_eq!(device.role, DeviceRole::Generic);
    let p1 = device.io("P1").unwrap();
    assert_eq!(p1.status, IoStatus::Unmapped);
    assert_eq!(p1.friendly, None);
    assert_eq!(p1.raw_type, 129);
}

#[test]
fn test_override_changes_next_build_only() {
    let builder = create_builder();
    let raw = raw_device("SL_SC_THL", json!({ "Z": { "type": 3, "val": 1234 } }));
    let before = builder.apply(&raw);

    let replacement = builder
        .registry()
        .with_overrides(&[hubsync_core::config::MappingOverrideConfig {
            device_type: "SL_SC_THL".into(),
            io: "Z".into(),
            role: "illuminance".into(),
            unit: Some("klx".into()),
            state_class: None,
            rule: "scale:1000".into(),
        }])
        .unwrap();
    builder.shared_registry().swap(replacement);

    assert_eq!(before.io("Z").unwrap().friendly, Some(FriendlyValue::Int(1234)));
    let after = builder.apply(&raw);
    assert_eq!(after.io("Z").unwrap().friendly, Some(FriendlyValue::Float(1.234)));
    assert_eq!(after.io("Z").unwrap().unit.as_deref(), Some("klx"));
}
