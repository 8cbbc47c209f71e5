//! Error surface of the read path.
//!
//! Every failure a reader can observe is a [`ReadError`]; [`ReadError::kind`] folds the
//! variants into the six coarse categories callers usually branch on, and the
//! `From<ReadError> for std::io::Error` impl lets a FUSE-style adapter turn them into errno.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error shared between every waiter of one failed operation.
pub type SharedError = Arc<anyhow::Error>;

pub type Result<T> = std::result::Result<T, ReadError>;

/// Why a file rejects reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCondition {
    Deleted,
    Invalid,
    NotAFile,
}

impl fmt::Display for FileCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileCondition::Deleted => f.write_str("file deleted"),
            FileCondition::Invalid => f.write_str("file invalidated"),
            FileCondition::NotAFile => f.write_str("not a regular file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    RangeError,
    LockConflict,
    ResourceExhausted,
    UnderlyingIoFailure,
    ServiceUnavailable,
}

#[derive(Error, Debug, Clone)]
pub enum ReadError {
    #[error("invalid file state: {0}")]
    InvalidState(FileCondition),

    #[error("end of file: offset {offset} is not below file size {size}")]
    EndOfFile { offset: u64, size: u64 },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("byte range at {offset} (+{len}) is locked by another owner")]
    LockConflict { offset: u64, len: u64 },

    #[error("insufficient resources: {0}")]
    ResourceExhausted(String),

    // Reported as an exhausted resource: the extent could not be made resident.
    #[error("extent population failed: {0:#}")]
    PopulationFailed(SharedError),

    #[error("local i/o failed: {0:#}")]
    UnderlyingIo(SharedError),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(&'static str),
}

impl ReadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReadError::InvalidState(_) => ErrorKind::InvalidState,
            ReadError::EndOfFile { .. } | ReadError::InvalidRange(_) => ErrorKind::RangeError,
            ReadError::LockConflict { .. } => ErrorKind::LockConflict,
            ReadError::ResourceExhausted(_) | ReadError::PopulationFailed(_) => {
                ErrorKind::ResourceExhausted
            }
            ReadError::UnderlyingIo(_) => ErrorKind::UnderlyingIoFailure,
            ReadError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
        }
    }

    pub fn io(err: impl Into<anyhow::Error>) -> Self {
        ReadError::UnderlyingIo(Arc::new(err.into()))
    }

    pub fn population(err: impl Into<anyhow::Error>) -> Self {
        ReadError::PopulationFailed(Arc::new(err.into()))
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ReadError::EndOfFile { .. })
    }
}

impl From<ReadError> for std::io::Error {
    fn from(err: ReadError) -> Self {
        use std::io::ErrorKind as IoKind;

        let kind = match &err {
            ReadError::InvalidState(FileCondition::Deleted) => IoKind::NotFound,
            ReadError::InvalidState(FileCondition::Invalid) => IoKind::StaleNetworkFileHandle,
            ReadError::InvalidState(FileCondition::NotAFile) => IoKind::IsADirectory,
            ReadError::EndOfFile { .. } => IoKind::UnexpectedEof,
            ReadError::InvalidRange(_) => IoKind::InvalidInput,
            ReadError::LockConflict { .. } => IoKind::ResourceBusy,
            ReadError::ResourceExhausted(_) | ReadError::PopulationFailed(_) => IoKind::OutOfMemory,
            ReadError::UnderlyingIo(_) => IoKind::Other,
            ReadError::ServiceUnavailable(_) => IoKind::NotConnected,
        };
        std::io::Error::new(kind, err)
    }
}
