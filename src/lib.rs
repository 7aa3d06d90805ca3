//! FileDrive Core - Multi-tenant file storage engine
//!
//! This crate provides the storage-and-transfer core of a personal file
//! drive: a bounded cache of OS file handles, resumable chunked uploads
//! with atomic promotion, per-user quota accounting, token-bucket I/O
//! throttling and short share identifiers for published directories.
//!
//! Transport, authentication and UI live outside this crate; callers hand
//! in a verified [`namespace::Caller`] and get a [`Result`] back.

pub mod config;
pub mod download;
pub mod drive;
pub mod hashing;
pub mod limiter;
pub mod locks;
pub mod logging;
pub mod metadata;
pub mod namespace;
pub mod quota;
pub mod sharing;
pub mod storage;
pub mod upload;

pub use config::DriveConfig;
pub use drive::Drive;
pub use namespace::{Caller, Role};

use std::io;

use thiserror::Error;

/// Main error type for FileDrive operations
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Quota exceeded for {user}: used {used} + requested {requested} > limit {limit}")]
    QuotaExceeded {
        user: String,
        used: u64,
        requested: u64,
        limit: u64,
    },

    #[error("Offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("Chunk too large: {remaining} bytes remaining, got {got}")]
    ChunkTooLarge { remaining: u64, got: u64 },

    #[error("Too many open handles (limit {0})")]
    TooManyOpenHandles(usize),

    #[error("Resource is locked: {0}")]
    LockContention(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request of {got} bytes exceeds the per-cycle rate cap {cap}")]
    OverRateCap { cap: u64, got: u64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many duplicates of {0}")]
    TooManyDuplicates(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Service closed")]
    Closed,

    #[error("Metadata store error: {0}")]
    Metadata(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DriveError {
    /// Classify an OS error raised while working on `path`.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => DriveError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => DriveError::AlreadyExists(path.to_string()),
            io::ErrorKind::PermissionDenied => DriveError::PermissionDenied(path.to_string()),
            _ => DriveError::Io(err),
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriveError::QuotaExceeded { .. }
                | DriveError::TooManyOpenHandles(_)
                | DriveError::LockContention(_)
                | DriveError::RateLimited(_)
        )
    }
}

impl From<bincode::Error> for DriveError {
    fn from(err: bincode::Error) -> Self {
        DriveError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DriveError {
    fn from(err: serde_json::Error) -> Self {
        DriveError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_classified() {
        let err = DriveError::from_io(io::Error::from(io::ErrorKind::NotFound), "u/files/a");
        assert!(matches!(err, DriveError::NotFound(p) if p == "u/files/a"));

        let err = DriveError::from_io(io::Error::from(io::ErrorKind::AlreadyExists), "x");
        assert!(matches!(err, DriveError::AlreadyExists(_)));

        let err = DriveError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "x");
        assert!(matches!(err, DriveError::PermissionDenied(_)));

        let err = DriveError::from_io(io::Error::from(io::ErrorKind::Interrupted), "x");
        assert!(matches!(err, DriveError::Io(_)));
    }

    #[test]
    fn test_retryable_class() {
        assert!(DriveError::LockContention("p".into()).is_retryable());
        assert!(DriveError::TooManyOpenHandles(4).is_retryable());
        assert!(!DriveError::OffsetMismatch { expected: 0, got: 5 }.is_retryable());
        assert!(!DriveError::InvalidState("bad".into()).is_retryable());
        assert!(DriveError::RateLimited("p".into()).is_retryable());
        assert!(!DriveError::OverRateCap { cap: 10, got: 11 }.is_retryable());
    }
}
