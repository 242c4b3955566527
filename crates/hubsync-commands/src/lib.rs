//! Command dispatch for hubsync.
//!
//! Write intents are grouped per hub and delivered under one of three speed
//! tiers:
//!
//! - `normal`: sequential, acknowledged, retried on transient errors
//! - `fast`: one unacknowledged batch pass, then acknowledged resends
//! - `extreme`: one unacknowledged batch pass, no guarantee
//!
//! The wire is reached through the [`HubWriter`] port.

pub mod batch;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod probe;
pub mod writer;

pub use batch::{BatchOutcome, CommandBatch};
pub use command::{
    Command, CommandFailure, CommandId, CommandRecord, CommandState, RetryPolicy, SpeedTier,
};
pub use dispatcher::{CommandDispatcher, DispatcherBuilder, DispatcherConfig, SubmissionHandle};
pub use error::{DispatchError, FailureKind, WireError};
pub use probe::StoreProbe;
pub use writer::{EffectProbe, HubWriter};
