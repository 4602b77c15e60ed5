#![forbid(unsafe_code)]
//! Error types for ReBlock.
//!
//! Defines `ReblockError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for the CLI exit status.

use thiserror::Error;

/// Unified error type for all ReBlock operations.
#[derive(Debug, Error)]
pub enum ReblockError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("value out of representable range: {0}")]
    Overflow(String),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("malformed extent file: {0}")]
    Proto(String),

    #[error("internal inconsistency: {0}")]
    Internal(String),

    #[error("I/O layer is not open")]
    NotConnected,
}

impl ReblockError {
    /// Convert this error into a POSIX errno suitable as an exit status.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Overflow(_) => libc::EOVERFLOW,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::Proto(_) => libc::EPROTO,
            Self::Internal(_) => libc::EFAULT,
            Self::NotConnected => libc::ENOTCONN,
        }
    }
}

/// Result alias using `ReblockError`.
pub type Result<T> = std::result::Result<T, ReblockError>;
