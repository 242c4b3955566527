//! Dispatch errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hubsync_core::ErrorClass;

/// What the host should tell the user about a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; the device or hub may come back on its own.
    Unreachable,
    /// The command itself was refused; the caller has to change something.
    Rejected,
}

/// Outcome of one wire write that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device or hub offline or busy.
    #[error("Unreachable ({code}): {message}")]
    Unreachable { code: i64, message: String },

    /// The server refused this command.
    #[error("Rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// Signature, timestamp or method problem. Never retried.
    #[error("Protocol error ({code}): {message}")]
    Protocol { code: i64, message: String },
}

impl WireError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WireError::Transport(_) | WireError::Timeout(_) | WireError::Unreachable { .. }
        )
    }

    pub fn kind(&self) -> FailureKind {
        if self.is_transient() {
            FailureKind::Unreachable
        } else {
            FailureKind::Rejected
        }
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            WireError::Transport(_) | WireError::Timeout(_) => None,
            WireError::Unreachable { code, .. }
            | WireError::Rejected { code, .. }
            | WireError::Protocol { code, .. } => Some(*code),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            WireError::Transport(_) | WireError::Timeout(_) => ErrorClass::Transport,
            WireError::Protocol { .. } => ErrorClass::Protocol,
            WireError::Unreachable { .. } | WireError::Rejected { .. } => ErrorClass::PartialBatch,
        }
    }
}

impl From<hubsync_core::Error> for WireError {
    fn from(e: hubsync_core::Error) -> Self {
        use hubsync_core::Error;
        match e {
            Error::Transport(m) => WireError::Transport(m),
            Error::Timeout(m) => WireError::Timeout(m),
            Error::Protocol { code, message } => WireError::Protocol { code, message },
            Error::PartialBatch { code, message } => WireError::Rejected { code, message },
            Error::Auth(m) => WireError::Protocol { code: -1, message: m },
            other => WireError::Rejected {
                code: -1,
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for hubsync_core::Error {
    fn from(e: WireError) -> Self {
        use hubsync_core::Error;
        match e {
            WireError::Transport(m) => Error::Transport(m),
            WireError::Timeout(m) => Error::Timeout(m),
            WireError::Protocol { code, message } => Error::Protocol { code, message },
            WireError::Unreachable { code, message } | WireError::Rejected { code, message } => {
                Error::PartialBatch { code, message }
            }
        }
    }
}

/// Submission errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dispatcher is shut down")]
    Closed,

    #[error("Empty batch")]
    EmptyBatch,

    #[error("Command for hub {found} submitted to hub {expected}")]
    HubMismatch { expected: String, found: String },

    #[error("Unknown speed tier: {0}")]
    UnknownTier(String),
}

impl From<DispatchError> for hubsync_core::Error {
    fn from(e: DispatchError) -> Self {
        hubsync_core::Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_distinguishes_unreachable_from_rejected() {
        assert_eq!(WireError::Timeout("5s".into()).kind(), FailureKind::Unreachable);
        assert_eq!(
            WireError::Unreachable { code: 10010, message: "offline".into() }.kind(),
            FailureKind::Unreachable
        );
        assert_eq!(
            WireError::Rejected { code: 10001, message: "bad args".into() }.kind(),
            FailureKind::Rejected
        );
        assert!(!WireError::Protocol { code: 10004, message: "sign".into() }.is_transient());
    }

    #[test]
    fn test_core_error_round_trip_keeps_class() {
        let wire: WireError = hubsync_core::Error::protocol(10005, "stale").into();
        assert_eq!(wire.class(), ErrorClass::Protocol);
        let core: hubsync_core::Error = WireError::Transport("reset".into()).into();
        assert!(core.is_transient());
    }
}
