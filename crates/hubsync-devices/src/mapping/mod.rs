//! Mapping registry and value converter.
//!
//! - [`ConversionRule`] turns raw `(type, val)` pairs into friendly values
//! - [`MappingEntry`] names the role, unit and rule for one IO
//! - [`MappingRegistry`] is the immutable device-type table
//! - [`SharedRegistry`] publishes replacement registries atomically

mod builtin;
mod entry;
mod registry;
mod rule;

pub use entry::{
    Classifier, DeviceRole, KeyPattern, MappingEntry, SemanticRole, StateClass, ValueMatch,
};
pub use registry::{DeviceTypeMapping, MappingRegistry, SharedRegistry};
pub use rule::{ConversionRule, FriendlyValue};
