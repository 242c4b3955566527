//! Device model for hubsync.
//!
//! This crate turns the vendor's raw, bit-packed device payloads into a typed
//! hub → device → IO tree:
//!
//! - [`raw_type`]: named view of the packed IO `type` field
//! - [`mapping`]: declarative registry and value converter
//! - [`builder`]: snapshot and delta application
//! - [`store`]: copy-on-write device store with immutable reader snapshots
//! - [`event`]: normalized change events for the host

pub mod builder;
pub mod classify;
pub mod error;
pub mod event;
pub mod mapping;
pub mod model;
pub mod payload;
pub mod raw_type;
pub mod store;

pub use builder::{BuiltSnapshot, DeviceModelBuilder};
pub use error::{MappingError, MappingResult};
pub use event::{AuditRecord, DeviceEvent, DeviceEventBus, ResyncReason};
pub use mapping::{
    ConversionRule, DeviceRole, FriendlyValue, KeyPattern, MappingEntry, MappingRegistry,
    SemanticRole, SharedRegistry, StateClass,
};
pub use model::{ConnectionMode, Device, Hub, IoState, IoStatus, RawValue};
pub use payload::{IoDelta, RawDevice, RawHub, RawIo, RawSnapshot};
pub use raw_type::{RawType, TYPE_OFF, TYPE_ON, TYPE_SET_VALUE};
pub use store::{DeltaOutcome, DeviceStore, HubSnapshot};
