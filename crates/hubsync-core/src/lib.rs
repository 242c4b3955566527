//! Core types shared by every hubsync crate.
//!
//! This crate owns the pieces that are not specific to devices, commands or
//! the cloud protocol:
//! - the cross-crate [`Error`] and its taxonomy ([`ErrorClass`])
//! - bridge configuration loading ([`config::BridgeConfig`])
//! - the in-process broadcast [`EventBus`]
//! - the [`Diagnostics`] counters consumed by the host
//! - tracing bootstrap for binaries

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod eventbus;
pub mod logging;

pub use config::{BridgeConfig, Region};
pub use diagnostics::{ActiveOperation, Diagnostics, DiagnosticsSnapshot, ErrorCounter};
pub use error::{Error, ErrorClass, Result};
pub use eventbus::{
    EventBus, EventBusReceiver, EventMetadata, FilteredReceiver, DEFAULT_CHANNEL_CAPACITY,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{
        AccountConfig, ApiConfig, BridgeConfig, DispatchConfig, MappingOverrideConfig, Region,
        StreamConfig,
    };
    pub use crate::diagnostics::Diagnostics;
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::eventbus::{EventBus, EventMetadata};
}
