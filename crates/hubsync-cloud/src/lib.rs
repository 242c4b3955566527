//! Cloud protocol for hubsync.
//!
//! - [`signing`]: pluggable request signing and timestamp window
//! - [`rest`]: signed REST client for snapshots and writes; implements the
//!   dispatcher's `HubWriter`
//! - [`envelope`]: push stream frame codec
//! - [`connector`]: stream transport ports and the WebSocket implementation
//! - [`sync`]: the event synchronizer, with [`reconcile`] holding its resync
//!   rules

pub mod backoff;
pub mod codes;
pub mod connector;
pub mod envelope;
pub mod reconcile;
pub mod rest;
pub mod signing;
pub mod sync;

pub use backoff::{Backoff, BackoffPolicy};
pub use connector::{Frame, StreamConnection, StreamConnector, WsConnector};
pub use envelope::{Envelope, StreamEvent};
pub use reconcile::{Reconciler, SeqCheck, SyncCursor};
pub use rest::{CloudClient, CloudClientConfig, RequestEnvelope, ResponseEnvelope, SnapshotDegree};
pub use signing::{
    Clock, FixedClock, HmacSha256Signer, RequestSigner, SignatureWindow, SigningPolicy, Stamp,
    SystemClock,
};
pub use sync::{
    EventSynchronizer, SignedStreamAuth, SnapshotSource, StreamAuthenticator, SyncConfig,
    SyncHandle,
};
