//! Errors raised while building the mapping registry.
//!
//! Value conversion never produces these: a payload that cannot be converted
//! is downgraded on the IO state instead.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("Unknown conversion rule: {0}")]
    UnknownRule(String),

    #[error("Unknown semantic role: {0}")]
    UnknownRole(String),

    #[error("Unknown state class: {0}")]
    UnknownStateClass(String),

    #[error("Invalid IO key pattern: {0}")]
    InvalidPattern(String),
}

pub type MappingResult<T> = std::result::Result<T, MappingError>;

impl From<MappingError> for hubsync_core::Error {
    fn from(e: MappingError) -> Self {
        hubsync_core::Error::Config(e.to_string())
    }
}
