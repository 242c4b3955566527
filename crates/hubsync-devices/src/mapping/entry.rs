//! Mapping entries, IO key patterns and dynamic classification rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::rule::ConversionRule;
use crate::error::MappingError;

/// What an IO measures or controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticRole {
    Temperature,
    Humidity,
    Illuminance,
    Battery,
    Voltage,
    Current,
    Power,
    Energy,
    Co2,
    Contact,
    Motion,
    Water,
    Switch,
    Brightness,
    Color,
    Position,
    /// Configuration word used only to classify the device.
    Mode,
    Generic,
}

impl SemanticRole {
    const ALL: [SemanticRole; 18] = [
        SemanticRole::Temperature,
        SemanticRole::Humidity,
        SemanticRole::Illuminance,
        SemanticRole::Battery,
        SemanticRole::Voltage,
        SemanticRole::Current,
        SemanticRole::Power,
        SemanticRole::Energy,
        SemanticRole::Co2,
        SemanticRole::Contact,
        SemanticRole::Motion,
        SemanticRole::Water,
        SemanticRole::Switch,
        SemanticRole::Brightness,
        SemanticRole::Color,
        SemanticRole::Position,
        SemanticRole::Mode,
        SemanticRole::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticRole::Temperature => "temperature",
            SemanticRole::Humidity => "humidity",
            SemanticRole::Illuminance => "illuminance",
            SemanticRole::Battery => "battery",
            SemanticRole::Voltage => "voltage",
            SemanticRole::Current => "current",
            SemanticRole::Power => "power",
            SemanticRole::Energy => "energy",
            SemanticRole::Co2 => "co2",
            SemanticRole::Contact => "contact",
            SemanticRole::Motion => "motion",
            SemanticRole::Water => "water",
            SemanticRole::Switch => "switch",
            SemanticRole::Brightness => "brightness",
            SemanticRole::Color => "color",
            SemanticRole::Position => "position",
            SemanticRole::Mode => "mode",
            SemanticRole::Generic => "generic",
        }
    }
}

impl fmt::Display for SemanticRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SemanticRole {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == wanted)
            .ok_or_else(|| MappingError::UnknownRole(s.to_string()))
    }
}

/// Instantaneous reading or a monotonically increasing total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

impl FromStr for StateClass {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "measurement" => Ok(StateClass::Measurement),
            "total_increasing" => Ok(StateClass::TotalIncreasing),
            other => Err(MappingError::UnknownStateClass(other.to_string())),
        }
    }
}

/// Role a whole device exposes to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// The classification selector has not been reported yet; not authoritative.
    Undetermined,
    /// Device type absent from the registry.
    Generic,
    Switch,
    Light,
    Cover,
    Climate,
    Sensor,
    BinarySensor,
}

impl DeviceRole {
    pub fn is_authoritative(&self) -> bool {
        *self != DeviceRole::Undetermined
    }
}

/// Which IO keys an entry applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum KeyPattern {
    /// Exactly this key.
    Exact(String),
    /// `prefix` followed by a channel number, e.g. `L1`, `L2`, ...
    Indexed(String),
    /// Any of several physically equivalent positions.
    AnyOf(Vec<String>),
}

impl KeyPattern {
    pub fn exact(key: impl Into<String>) -> Self {
        KeyPattern::Exact(key.into())
    }

    pub fn indexed(prefix: impl Into<String>) -> Self {
        KeyPattern::Indexed(prefix.into())
    }

    pub fn any_of(keys: &[&str]) -> Self {
        KeyPattern::AnyOf(keys.iter().map(|k| k.to_string()).collect())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(k) => k == key,
            KeyPattern::Indexed(prefix) => key
                .strip_prefix(prefix.as_str())
                .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false),
            KeyPattern::AnyOf(keys) => keys.iter().any(|k| k == key),
        }
    }

    /// Resolution precedence: exact, then any-of, then indexed.
    pub(crate) fn precedence(&self) -> u8 {
        match self {
            KeyPattern::Exact(_) => 0,
            KeyPattern::AnyOf(_) => 1,
            KeyPattern::Indexed(_) => 2,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Exact(k) => f.write_str(k),
            KeyPattern::Indexed(prefix) => write!(f, "{}*", prefix),
            KeyPattern::AnyOf(keys) => f.write_str(&keys.join("|")),
        }
    }
}

impl FromStr for KeyPattern {
    type Err = MappingError;

    /// `"T"` is exact, `"L*"` is indexed, `"P1|L1"` is any-of.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = |k: &str| !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

        if let Some(prefix) = s.strip_suffix('*') {
            return if valid(prefix) {
                Ok(KeyPattern::indexed(prefix))
            } else {
                Err(MappingError::InvalidPattern(s.to_string()))
            };
        }
        if s.contains('|') {
            let keys: Vec<&str> = s.split('|').map(str::trim).collect();
            return if keys.iter().all(|k| valid(k)) {
                Ok(KeyPattern::any_of(&keys))
            } else {
                Err(MappingError::InvalidPattern(s.to_string()))
            };
        }
        if valid(s) {
            Ok(KeyPattern::exact(s))
        } else {
            Err(MappingError::InvalidPattern(s.to_string()))
        }
    }
}

/// Test applied to a selector IO's raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum ValueMatch {
    Equals { value: i64 },
    /// `raw & mask == value`
    Masked { mask: i64, value: i64 },
    /// Inclusive range.
    Range { min: i64, max: i64 },
}

impl ValueMatch {
    pub fn matches(&self, raw: i64) -> bool {
        match *self {
            ValueMatch::Equals { value } => raw == value,
            ValueMatch::Masked { mask, value } => raw & mask == value,
            ValueMatch::Range { min, max } => (min..=max).contains(&raw),
        }
    }
}

/// Dynamic classification attached to the selector IO's entry.
///
/// Rules are tried in order; the first match decides the device role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classifier {
    pub rules: Vec<(ValueMatch, DeviceRole)>,
    pub fallback: DeviceRole,
}

impl Classifier {
    pub fn new(fallback: DeviceRole) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    pub fn when(mut self, matcher: ValueMatch, role: DeviceRole) -> Self {
        self.rules.push((matcher, role));
        self
    }

    pub fn evaluate(&self, selector: i64) -> DeviceRole {
        self.rules
            .iter()
            .find(|(m, _)| m.matches(selector))
            .map(|(_, role)| *role)
            .unwrap_or(self.fallback)
    }
}

/// How one IO of one device type is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub role: SemanticRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<StateClass>,
    pub rule: ConversionRule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier: Option<Classifier>,
}

impl MappingEntry {
    pub fn new(role: SemanticRole, rule: ConversionRule) -> Self {
        Self {
            role,
            unit: None,
            state_class: None,
            rule,
            classifier: None,
        }
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn measurement(mut self) -> Self {
        self.state_class = Some(StateClass::Measurement);
        self
    }

    pub fn total(mut self) -> Self {
        self.state_class = Some(StateClass::TotalIncreasing);
        self
    }

    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }
}
