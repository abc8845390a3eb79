//! Target connectors.
//!
//! A connector is the capability set the engine needs from backup storage.
//! All paths given to a connector are relative to its target root, so the
//! resolver and executor never assume local filesystem semantics. A remote
//! connector plugs in by implementing [`TargetConnector`].

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use crate::error::ConnectorError;

pub mod local;

pub use local::{LocalConnector, LocalStaging};

/// Write side of a staging location.
pub trait StagedWrite: Write + Send {
    /// Flush and make durable everything written so far.
    fn seal(&mut self) -> io::Result<()>;
}

/// Storage operations required from any backup target.
///
/// Staged content must never be visible at its final path before
/// [`promote`](TargetConnector::promote) succeeds. Dropping a staging handle
/// without promoting it must release the staged content.
pub trait TargetConnector: Send + Sync {
    type Staging: StagedWrite;

    /// Human-readable description of the target, for logs.
    fn describe(&self) -> String;

    /// Job-scoped check that the target is reachable and writable.
    fn check_ready(&self) -> Result<(), ConnectorError>;

    fn exists(&self, path: &Path) -> Result<bool, ConnectorError>;

    /// Open a temporary location for content destined for `final_path`.
    fn open_staging_write(&self, final_path: &Path) -> Result<Self::Staging, ConnectorError>;

    /// Read back what was staged, from storage rather than any buffer.
    fn read_staged<'s>(
        &self,
        staging: &'s mut Self::Staging,
    ) -> Result<Box<dyn Read + 's>, ConnectorError>;

    /// Atomically make the staged content become `final_path`.
    ///
    /// With `replace == false` an existing destination is never clobbered and
    /// `ConnectorError::DestinationExists` is returned instead.
    fn promote(
        &self,
        staging: Self::Staging,
        final_path: &Path,
        replace: bool,
    ) -> Result<(), ConnectorError>;

    /// Throw away a staging attempt.
    fn discard(&self, staging: Self::Staging) -> Result<(), ConnectorError>;

    /// Stream the content currently at `final_path`.
    fn read_back(&self, final_path: &Path) -> Result<Box<dyn Read + '_>, ConnectorError>;

    /// Directory backing the target when it is on a local filesystem.
    fn local_root(&self) -> Option<&Path> {
        None
    }

    /// Record a modification time on staged content. No-op by default.
    fn set_modified(
        &self,
        _staging: &mut Self::Staging,
        _modified: SystemTime,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}
