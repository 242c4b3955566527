//! Response codes returned by the cloud API.

use hubsync_commands::WireError;
use hubsync_core::Error;

pub const OK: i64 = 0;
pub const INVALID_ARGUMENT: i64 = 10001;
pub const UNKNOWN_METHOD: i64 = 10002;
pub const BAD_SIGNATURE: i64 = 10004;
pub const STALE_TIMESTAMP: i64 = 10005;
pub const NOT_AUTHORIZED: i64 = 10007;
pub const DEVICE_OFFLINE: i64 = 10010;
pub const HUB_BUSY: i64 = 10011;
pub const DEVICE_TIMEOUT: i64 = 10017;

/// What a non-zero code means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeClass {
    Ok,
    /// Device or hub offline or busy; worth retrying.
    Unreachable,
    /// The request itself was refused.
    Rejected,
    /// Signing, timestamp, credentials or method problem.
    Protocol,
}

pub fn classify(code: i64) -> CodeClass {
    match code {
        OK => CodeClass::Ok,
        DEVICE_OFFLINE | HUB_BUSY | DEVICE_TIMEOUT => CodeClass::Unreachable,
        UNKNOWN_METHOD | BAD_SIGNATURE | STALE_TIMESTAMP | NOT_AUTHORIZED => CodeClass::Protocol,
        _ => CodeClass::Rejected,
    }
}

/// Error for a whole call; `None` for success.
pub fn call_error(code: i64, message: impl Into<String>) -> Option<Error> {
    let message = message.into();
    match classify(code) {
        CodeClass::Ok => None,
        CodeClass::Protocol => Some(Error::Protocol { code, message }),
        CodeClass::Unreachable | CodeClass::Rejected => Some(Error::PartialBatch { code, message }),
    }
}

/// Error for one command inside a write; `None` for success.
pub fn item_error(code: i64, message: impl Into<String>) -> Option<WireError> {
    let message = message.into();
    match classify(code) {
        CodeClass::Ok => None,
        CodeClass::Unreachable => Some(WireError::Unreachable { code, message }),
        CodeClass::Rejected => Some(WireError::Rejected { code, message }),
        CodeClass::Protocol => Some(WireError::Protocol { code, message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(0), CodeClass::Ok);
        assert_eq!(classify(DEVICE_OFFLINE), CodeClass::Unreachable);
        assert_eq!(classify(STALE_TIMESTAMP), CodeClass::Protocol);
        assert_eq!(classify(INVALID_ARGUMENT), CodeClass::Rejected);
        assert_eq!(classify(99999), CodeClass::Rejected);
    }

    #[test]
    fn test_item_error_keeps_unreachable_transient() {
        assert!(item_error(OK, "").is_none());
        assert!(item_error(HUB_BUSY, "busy").unwrap().is_transient());
        assert!(!item_error(INVALID_ARGUMENT, "bad").unwrap().is_transient());
        assert!(matches!(
            call_error(BAD_SIGNATURE, "sign"),
            Some(Error::Protocol { code: BAD_SIGNATURE, .. })
        ));
    }
}
