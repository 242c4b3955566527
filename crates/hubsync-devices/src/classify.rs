//! Dynamic device classification.

use std::collections::BTreeMap;

use crate::mapping::{DeviceRole, DeviceTypeMapping};
use crate::model::IoState;

/// Role of a device given its type mapping and current IOs.
///
/// Types without a classifier report their static role. Types with one
/// report [`DeviceRole::Undetermined`] until the selector IO carries an
/// integer value.
pub fn classify(mapping: Option<&DeviceTypeMapping>, ios: &BTreeMap<String, IoState>) -> DeviceRole {
    let Some(mapping) = mapping else {
        return DeviceRole::Generic;
    };
    let Some((selector, classifier)) = mapping.classifier() else {
        return mapping.default_role;
    };

    ios.iter()
        .find(|(key, _)| selector.matches(key))
        .and_then(|(_, io)| io.raw_val.as_i64())
        .map(|raw| classifier.evaluate(raw))
        .unwrap_or(DeviceRole::Undetermined)
}

/// Whether a change to `io_key` can alter the device role.
pub fn is_selector(mapping: Option<&DeviceTypeMapping>, io_key: &str) -> bool {
    mapping
        .and_then(|m| m.classifier())
        .map(|(selector, _)| selector.matches(io_key))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingRegistry;
    use crate::model::{IoStatus, RawValue};

    fn io(key: &str, val: RawValue) -> (String, IoState) {
        (
            key.to_string(),
            IoState {
                key: key.to_string(),
                raw_type: 0,
                raw_type_wire: None,
                raw_val: val,
                friendly: None,
                name: None,
                status: IoStatus::Unmapped,
                role: None,
                unit: None,
                state_class: None,
                warning: None,
            },
        )
    }

    #[test]
    fn test_selector_absent_is_undetermined() {
        let registry = MappingRegistry::builtin();
        let nature = registry.device_type("SL_NATURE");
        let ios: BTreeMap<_, _> = [io("P1", RawValue::Int(1))].into_iter().collect();
        assert_eq!(classify(nature, &ios), DeviceRole::Undetermined);
        assert!(!classify(nature, &ios).is_authoritative());
    }

    #[test]
    fn test_selector_non_numeric_is_undetermined() {
        let registry = MappingRegistry::builtin();
        let nature = registry.device_type("SL_NATURE");
        let ios: BTreeMap<_, _> = [io("P5", RawValue::Other(serde_json::json!("x")))]
            .into_iter()
            .collect();
        assert_eq!(classify(nature, &ios), DeviceRole::Undetermined);
    }

    #[test]
    fn test_selector_value_decides() {
        let registry = MappingRegistry::builtin();
        let nature = registry.device_type("SL_NATURE");
        let switch: BTreeMap<_, _> = [io("P5", RawValue::Int(0x101))].into_iter().collect();
        let climate: BTreeMap<_, _> = [io("P5", RawValue::Int(3))].into_iter().collect();
        assert_eq!(classify(nature, &switch), DeviceRole::Switch);
        assert_eq!(classify(nature, &climate), DeviceRole::Climate);
        assert!(is_selector(nature, "P5"));
        assert!(!is_selector(nature, "P1"));
    }

    #[test]
    fn test_static_and_unknown_types() {
        let registry = MappingRegistry::builtin();
        let ios = BTreeMap::new();
        assert_eq!(classify(registry.device_type("SL_SC_THL"), &ios), DeviceRole::Sensor);
        assert_eq!(classify(None, &ios), DeviceRole::Generic);
    }
}
