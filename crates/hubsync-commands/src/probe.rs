//! Effect probe backed by the device store.

use std::sync::Arc;

use hubsync_devices::{DeviceStore, RawType, TYPE_SET_VALUE};

use crate::command::Command;
use crate::writer::EffectProbe;

/// Compares a command with the IO state currently in the store.
///
/// On/off writes are checked against the IO's type parity, value writes
/// against its raw value.
pub struct StoreProbe {
    store: Arc<DeviceStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<DeviceStore>) -> Self {
        Self { store }
    }
}

impl EffectProbe for StoreProbe {
    fn has_taken_effect(&self, command: &Command) -> Option<bool> {
        let io = self
            .store
            .io(&command.hub_id, &command.device_id, &command.io_key)?;

        if command.raw_type == TYPE_SET_VALUE {
            return io.raw_val.as_i64().map(|v| v == command.raw_val);
        }
        Some(io.is_on() == RawType::decode(command.raw_type).on)
    }
}
