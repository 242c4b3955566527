//! Built-in device table.
//!
//! Pure data. Adding a device type means adding rows here, never branches in
//! the builder.

use super::entry::{Classifier, DeviceRole, KeyPattern, MappingEntry, SemanticRole, ValueMatch};
use super::registry::DeviceTypeMapping;
use super::rule::ConversionRule;

use ConversionRule::{BitFloat, BooleanParity, Passthrough};
use SemanticRole::*;

const TENTHS: ConversionRule = ConversionRule::TENTHS;

fn exact(key: &str) -> KeyPattern {
    KeyPattern::exact(key)
}

fn battery() -> MappingEntry {
    MappingEntry::new(Battery, Passthrough).unit("%").measurement()
}

fn switch() -> MappingEntry {
    MappingEntry::new(Switch, BooleanParity)
}

/// Every built-in device type.
pub fn device_types() -> Vec<DeviceTypeMapping> {
    vec![
        // Temperature/humidity/light sensor. The wire carries `v` for T and H.
        DeviceTypeMapping::new("SL_SC_THL", DeviceRole::Sensor)
            .with(exact("T"), MappingEntry::new(Temperature, Passthrough).unit("°C").measurement())
            .with(exact("H"), MappingEntry::new(Humidity, Passthrough).unit("%").measurement())
            .with(exact("Z"), MappingEntry::new(Illuminance, Passthrough).unit("lx").measurement())
            .with(exact("V"), battery()),
        DeviceTypeMapping::new("SL_SC_CA", DeviceRole::Sensor)
            .with(exact("T"), MappingEntry::new(Temperature, TENTHS).unit("°C").measurement())
            .with(exact("H"), MappingEntry::new(Humidity, TENTHS).unit("%").measurement())
            .with(exact("P3"), MappingEntry::new(Co2, Passthrough).unit("ppm").measurement())
            .with(exact("V"), battery()),
        DeviceTypeMapping::new("SL_SC_G", DeviceRole::BinarySensor)
            .with(exact("G"), MappingEntry::new(Contact, BooleanParity))
            .with(exact("V"), battery()),
        DeviceTypeMapping::new("SL_SC_MHW", DeviceRole::BinarySensor)
            .with(exact("M"), MappingEntry::new(Motion, BooleanParity))
            .with(exact("V"), battery()),
        DeviceTypeMapping::new("SL_SC_WA", DeviceRole::BinarySensor)
            .with(exact("WA"), MappingEntry::new(Water, Passthrough))
            .with(exact("V"), battery()),
        // Metering plug: power and energy are float bit patterns.
        DeviceTypeMapping::new("SL_OE_DE", DeviceRole::Switch)
            .with(exact("P1"), switch())
            .with(exact("EP"), MappingEntry::new(Power, BitFloat).unit("W").measurement())
            .with(exact("EE"), MappingEntry::new(Energy, BitFloat).unit("kWh").total()),
        DeviceTypeMapping::new("SL_OE_3C", DeviceRole::Switch)
            .with(exact("P1"), switch())
            .with(exact("P2"), MappingEntry::new(Energy, BitFloat).unit("kWh").total())
            .with(exact("P3"), MappingEntry::new(Power, BitFloat).unit("W").measurement()),
        // Multi-gang switches: one entry covers every channel the unit reports.
        DeviceTypeMapping::new("SL_SW_IF3", DeviceRole::Switch)
            .with(KeyPattern::indexed("L"), switch()),
        DeviceTypeMapping::new("SL_SW_ND1", DeviceRole::Switch)
            .with(KeyPattern::any_of(&["L1", "P1"]), switch()),
        DeviceTypeMapping::new("SL_CT_RGBW", DeviceRole::Light)
            .with(exact("RGBW"), MappingEntry::new(Color, Passthrough))
            .with(exact("DYN"), MappingEntry::new(Generic, Passthrough)),
        DeviceTypeMapping::new("SL_DOOYA", DeviceRole::Cover)
            .with(exact("P1"), MappingEntry::new(Position, Passthrough).unit("%")),
        // General controller: the work mode lives in bits 25..27 of P1.
        DeviceTypeMapping::new("SL_P", DeviceRole::Undetermined)
            .with(
                exact("P1"),
                MappingEntry::new(Mode, Passthrough).classifier(
                    Classifier::new(DeviceRole::Generic)
                        .when(ValueMatch::Masked { mask: 0x0E00_0000, value: 0 }, DeviceRole::BinarySensor)
                        .when(ValueMatch::Masked { mask: 0x0E00_0000, value: 0x0200_0000 }, DeviceRole::Cover)
                        .when(ValueMatch::Masked { mask: 0x0E00_0000, value: 0x0400_0000 }, DeviceRole::Cover)
                        .when(ValueMatch::Masked { mask: 0x0E00_0000, value: 0x0800_0000 }, DeviceRole::Switch)
                        .when(ValueMatch::Masked { mask: 0x0E00_0000, value: 0x0A00_0000 }, DeviceRole::Switch),
                ),
            )
            .with(KeyPattern::any_of(&["P2", "P3", "P4"]), switch())
            .with(KeyPattern::any_of(&["P5", "P6", "P7"]), MappingEntry::new(Contact, BooleanParity)),
        // Wall panel: P5 low byte selects switch panel or thermostat.
        DeviceTypeMapping::new("SL_NATURE", DeviceRole::Undetermined)
            .with(exact("P1"), switch())
            .with(exact("P2"), switch())
            .with(exact("P3"), switch())
            .with(exact("P4"), MappingEntry::new(Temperature, TENTHS).unit("°C").measurement())
            .with(
                exact("P5"),
                MappingEntry::new(Mode, Passthrough).classifier(
                    Classifier::new(DeviceRole::Generic)
                        .when(ValueMatch::Masked { mask: 0xFF, value: 1 }, DeviceRole::Switch)
                        .when(ValueMatch::Masked { mask: 0xFF, value: 3 }, DeviceRole::Climate)
                        .when(ValueMatch::Masked { mask: 0xFF, value: 6 }, DeviceRole::Climate),
                ),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingRegistry;

    #[test]
    fn test_type_ids_unique() {
        let types = device_types();
        let registry = MappingRegistry::builtin();
        assert_eq!(registry.len(), types.len());
    }

    #[test]
    fn test_energy_entries_are_totals() {
        let registry = MappingRegistry::builtin();
        let ee = registry.resolve("SL_OE_DE", "EE").unwrap();
        assert_eq!(ee.rule, ConversionRule::BitFloat);
        assert_eq!(ee.state_class, Some(crate::mapping::StateClass::TotalIncreasing));
    }

    #[test]
    fn test_single_classifier_per_type() {
        for mapping in device_types() {
            let count = mapping
                .entries
                .iter()
                .filter(|(_, e)| e.classifier.is_some())
                .count();
            assert!(count <= 1, "{} has {} classifiers", mapping.type_id, count);
        }
    }
}
