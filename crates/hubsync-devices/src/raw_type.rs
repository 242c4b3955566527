//! Decoding of the bit-packed IO `type` field.
//!
//! The wire `type` mixes several independent facts:
//!
//! | bits | meaning |
//! |------|---------|
//! | 0    | on/off parity (odd = on) |
//! | 1..6 | value class |
//! | 7    | control type (set by writes and by state echoes of writes) |
//!
//! Callers decode once into [`RawType`] and test named fields.

use serde::{Deserialize, Serialize};

/// Write: switch on.
pub const TYPE_ON: i64 = 0x81;
/// Write: switch off.
pub const TYPE_OFF: i64 = 0x80;
/// Write: set a value.
pub const TYPE_SET_VALUE: i64 = 0xCF;

const ON_BIT: i64 = 0x01;
const CONTROL_BIT: i64 = 0x80;
const CLASS_MASK: i64 = 0x3F;

/// Decoded view of a raw IO type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawType {
    pub raw: i64,
    pub on: bool,
    pub control: bool,
    pub class: u8,
}

impl RawType {
    pub fn decode(raw: i64) -> Self {
        Self {
            raw,
            on: raw & ON_BIT == ON_BIT,
            control: raw & CONTROL_BIT == CONTROL_BIT,
            class: ((raw >> 1) & CLASS_MASK) as u8,
        }
    }

    /// Parity as a 0/1 integer.
    pub fn parity(&self) -> i64 {
        i64::from(self.on)
    }
}

impl From<i64> for RawType {
    fn from(raw: i64) -> Self {
        Self::decode(raw)
    }
}
