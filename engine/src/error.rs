//! Error types for the backup engine.
//!
//! Errors are split by scope:
//! - `ValidationError`: the job definition is unusable; raised before any I/O.
//! - `ConnectorError`: a target storage operation failed. At job scope
//!   (the pre-flight readiness check) it is fatal; inside a single item it is
//!   recorded on that item's `TransferResult` and the run continues.
//! - `EngineError`: top-level error for callers that load configuration or
//!   construct runners.
//!
//! Per-item failures never surface as `Err` from the runner. They are
//! recorded in `TransferResult`, not returned.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The job definition cannot be executed as given.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("job definition has no source roots")]
    NoSourceRoots,

    #[error("job definition has an empty target location")]
    EmptyTarget,

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("unknown {field} '{value}'")]
    UnknownValue { field: &'static str, value: String },

    #[error("connector root {} does not belong to target {}", actual.display(), declared.display())]
    TargetMismatch { declared: PathBuf, actual: PathBuf },
}

/// Failures of target connector operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The target root cannot be reached or created.
    #[error("target unreachable: {}", path.display())]
    Unreachable { path: PathBuf, source: io::Error },

    /// The target exists but rejects writes.
    #[error("target not writable: {}", path.display())]
    NotWritable { path: PathBuf, source: io::Error },

    /// A single storage operation failed.
    #[error("{operation} failed for {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// No-clobber promotion found the destination already taken.
    #[error("destination already exists: {}", path.display())]
    DestinationExists { path: PathBuf },

    /// Every `name (N).ext` candidate was taken.
    #[error("no free name found for {} after {attempts} attempts", path.display())]
    NamesExhausted { path: PathBuf, attempts: u32 },

    /// The path would escape the target root.
    #[error("path escapes target root: {}", path.display())]
    OutsideTarget { path: PathBuf },
}

impl ConnectorError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ConnectorError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Unreachable { source, .. }
            | Self::NotWritable { source, .. }
            | Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid job definition: {0}")]
    Validation(#[from] ValidationError),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("source root does not exist: {}", path.display())]
    SourceRootMissing { path: PathBuf },

    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
