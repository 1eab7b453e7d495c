//! Error types for spandisk
//!
//! This module defines the common error type used by the storage layer
//! and below. Device-level errors (configuration, address translation)
//! live in `spandisk-device` and wrap this type.

use thiserror::Error;

/// Common result type for spandisk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for spandisk
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device is busy: {0}")]
    Busy(String),

    #[error("not a block device or regular file: {0}")]
    WrongType(String),

    #[error("read-only device: {0}")]
    ReadOnly(String),

    #[error("unaligned access: offset {offset}, length {length}, alignment {alignment}")]
    Unaligned {
        offset: u64,
        length: usize,
        alignment: usize,
    },

    #[error("out of range: offset {offset} + length {length} exceeds size {size}")]
    OutOfRange {
        offset: u64,
        length: usize,
        size: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error means the resource is held by someone else
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_busy() {
        assert!(Error::Busy("/dev/sd0a".into()).is_busy());
        assert!(!Error::storage("nope").is_busy());
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
