//! Unified error handling for hubsync.
//!
//! Every crate converts its local failures into [`Error`] when they cross a
//! crate boundary. Callers that need to decide on retries or user-facing
//! wording look at [`Error::class`] instead of matching on strings.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
///
/// The class decides what happens next: transport failures are retried,
/// protocol failures are surfaced immediately, discontinuities trigger a
/// resync, conversion failures never leave the device model builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout, connection reset, DNS or TLS failure.
    Transport,
    /// Signature rejected, stale timestamp, unknown method, bad credentials.
    Protocol,
    /// A single command failed inside an otherwise accepted batch.
    PartialBatch,
    /// Raw payload could not be turned into a typed value.
    Conversion,
    /// The push stream lost continuity with the server state.
    Discontinuity,
    /// Local defects: configuration, serialization, task failures.
    Local,
}

/// Unified error type for hubsync.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure before a response was received.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote end did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The server understood the request and refused it for a protocol reason.
    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// One command inside a batch failed.
    #[error("Batch item failed with code {code}: {message}")]
    PartialBatch { code: i64, message: String },

    /// Authentication with the push stream or REST API failed.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Raw value conversion failed.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Push stream continuity was lost.
    #[error("Stream discontinuity: {0}")]
    Discontinuity(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport(_) | Error::Timeout(_) => ErrorClass::Transport,
            Error::Protocol { .. } | Error::Auth(_) => ErrorClass::Protocol,
            Error::PartialBatch { .. } => ErrorClass::PartialBatch,
            Error::Conversion(_) => ErrorClass::Conversion,
            Error::Discontinuity(_) => ErrorClass::Discontinuity,
            Error::Config(_)
            | Error::Serialization(_)
            | Error::NotFound(_)
            | Error::Internal(_) => ErrorClass::Local,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convenience macros for creating errors.
#[macro_export]
macro_rules! config_err {
    ($msg:expr) => {
        $crate::error::Error::Config($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_err {
    ($msg:expr) => {
        $crate::error::Error::Transport($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Transport(format!($fmt, $($arg)*))
    };
}

// Error conversion helpers
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(Error::transport("reset by peer").is_transient());
        assert!(Error::timeout("10s").is_transient());
        assert!(!Error::protocol(10004, "bad sign").is_transient());
        assert!(!Error::auth("expired").is_transient());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(Error::protocol(10005, "stale").class(), ErrorClass::Protocol);
        assert_eq!(
            Error::PartialBatch {
                code: 10010,
                message: "offline".into()
            }
            .class(),
            ErrorClass::PartialBatch
        );
        assert_eq!(
            Error::Discontinuity("gap".into()).class(),
            ErrorClass::Discontinuity
        );
        assert_eq!(Error::config("x").class(), ErrorClass::Local);
    }

    #[test]
    fn test_macros() {
        let err = config_err!("missing {}", "app_key");
        assert_eq!(err.to_string(), "Configuration error: missing app_key");
        let err = transport_err!("closed");
        assert!(err.is_transient());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
