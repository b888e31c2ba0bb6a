//! Error handling.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use anyhow::Error as AnyError;
use displaydoc::Display;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// An error.
#[derive(Debug, Display)]
pub enum ArchiveError {
    /// Unsupported parameter style "{name}".
    UnsupportedParamStyle { name: String },

    /// Malformed query template: {reason}
    ParamError { reason: String },

    /// Insufficient space on {path:?}: {needed} bytes requested, {available} available.
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    /// Database communication error: {0}
    DbCommunicationFailure(AnyError),

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Unique constraint violated: {0}
    ConstraintViolation(AnyError),

    /// Duplicate version {version} for file "{file_id}" on disk "{disk_id}".
    DuplicateVersion {
        disk_id: String,
        file_id: String,
        version: u32,
    },

    /// Staging area error: {0}
    StagingAreaFailure(AnyError),

    /// Back-log buffering error: {0}
    BackLogBufferFailure(AnyError),

    /// File move error: {0}
    FileMoveFailure(AnyError),

    /// Quarantine error: {0}
    QuarantineFailure(AnyError),

    /// I/O error: {error}
    IoError { error: io::Error },
}

impl ArchiveError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn staging_area_failure(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StagingAreaFailure(AnyError::new(error))
    }

    pub fn back_log_buffer_failure(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::BackLogBufferFailure(AnyError::new(error))
    }

    pub fn file_move_failure(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::FileMoveFailure(AnyError::new(error))
    }

    pub fn quarantine_failure(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::QuarantineFailure(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UnsupportedParamStyle { .. } => "UnsupportedParamStyle",
            Self::ParamError { .. } => "ParamError",
            Self::InsufficientSpace { .. } => "InsufficientSpace",
            Self::DbCommunicationFailure(_) => "DbCommunicationFailure",
            Self::DatabaseError(_) => "DatabaseError",
            Self::ConstraintViolation(_) => "ConstraintViolation",
            Self::DuplicateVersion { .. } => "DuplicateVersion",
            Self::StagingAreaFailure(_) => "StagingAreaFailure",
            Self::BackLogBufferFailure(_) => "BackLogBufferFailure",
            Self::FileMoveFailure(_) => "FileMoveFailure",
            Self::QuarantineFailure(_) => "QuarantineFailure",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for ArchiveError {}

impl From<io::Error> for ArchiveError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}
