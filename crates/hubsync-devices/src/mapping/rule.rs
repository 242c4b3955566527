//! Conversion rules and the value converter.
//!
//! Conversion is pure: the same `(rule, raw type, raw value)` always gives
//! the same friendly value, so a device tree can be rebuilt from raw fields
//! at any time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MappingError;
use crate::raw_type::RawType;

/// Decoded value of an IO.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FriendlyValue {
    Int(i64),
    Float(f64),
}

impl FriendlyValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FriendlyValue::Int(i) => *i as f64,
            FriendlyValue::Float(f) => *f,
        }
    }

    /// Friendly value from a JSON number, keeping integers integral.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FriendlyValue::Int(i)),
                None => n.as_f64().map(FriendlyValue::Float),
            },
            _ => None,
        }
    }
}

impl fmt::Display for FriendlyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FriendlyValue::Int(i) => write!(f, "{}", i),
            FriendlyValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// How a raw `(type, val)` pair becomes a friendly value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ConversionRule {
    /// `val / divisor`; the type is ignored.
    LinearScale { divisor: u32 },
    /// The low 32 bits of `val` are an IEEE-754 single.
    BitFloat,
    /// `1` when the type is odd, else `0`; the value is ignored.
    BooleanParity,
    /// `val` unchanged.
    Passthrough,
}

impl ConversionRule {
    pub const TENTHS: ConversionRule = ConversionRule::LinearScale { divisor: 10 };
    pub const HUNDREDTHS: ConversionRule = ConversionRule::LinearScale { divisor: 100 };

    /// Whether the rule reads the raw value (all but parity do).
    pub fn needs_value(&self) -> bool {
        !matches!(self, ConversionRule::BooleanParity)
    }

    /// Convert a raw pair. `None` when the rule has no meaningful result for
    /// the input, e.g. a bit pattern that decodes to NaN.
    pub fn convert(&self, raw_type: i64, raw_val: i64) -> Option<FriendlyValue> {
        match self {
            ConversionRule::LinearScale { divisor } => {
                if *divisor == 0 {
                    return None;
                }
                Some(FriendlyValue::Float(raw_val as f64 / f64::from(*divisor)))
            }
            ConversionRule::BitFloat => {
                if raw_val < i64::from(i32::MIN) || raw_val > i64::from(u32::MAX) {
                    return None;
                }
                let value = f32::from_bits(raw_val as u32);
                value
                    .is_finite()
                    .then(|| FriendlyValue::Float(f64::from(value)))
            }
            ConversionRule::BooleanParity => {
                Some(FriendlyValue::Int(RawType::decode(raw_type).parity()))
            }
            ConversionRule::Passthrough => Some(FriendlyValue::Int(raw_val)),
        }
    }
}

impl fmt::Display for ConversionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionRule::LinearScale { divisor: 10 } => write!(f, "tenths"),
            ConversionRule::LinearScale { divisor: 100 } => write!(f, "hundredths"),
            ConversionRule::LinearScale { divisor } => write!(f, "scale:{}", divisor),
            ConversionRule::BitFloat => write!(f, "bit_float"),
            ConversionRule::BooleanParity => write!(f, "boolean_parity"),
            ConversionRule::Passthrough => write!(f, "passthrough"),
        }
    }
}

impl FromStr for ConversionRule {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "tenths" => Ok(Self::TENTHS),
            "hundredths" => Ok(Self::HUNDREDTHS),
            "bit_float" => Ok(Self::BitFloat),
            "boolean_parity" => Ok(Self::BooleanParity),
            "passthrough" => Ok(Self::Passthrough),
            _ => s
                .strip_prefix("scale:")
                .and_then(|d| d.parse::<u32>().ok())
                .filter(|d| *d > 0)
                .map(|divisor| Self::LinearScale { divisor })
                .ok_or_else(|| MappingError::UnknownRule(s.to_string())),
        }
    }
}
