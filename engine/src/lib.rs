//! # Keepsafe Engine - Verified Backup Library
//!
//! A headless backup execution engine: it takes a job definition, finds the
//! files to back up, decides where each one goes on the target, and copies
//! them so that a destination file is either fully written and verified or
//! not touched at all.
//!
//! ## Overview
//!
//! The engine is a lazy pipeline run by a single job runner:
//! - Enumeration of source roots with include/exclude glob filtering
//! - Per-target conflict resolution (overwrite, rename, skip)
//! - Staged writes with streaming SHA-256 (or BLAKE3) checksums
//! - Read-back verification before an atomic promote
//! - Run reporting through a record sink (decoupled from any UI)
//! - Cooperative cancellation between items
//!
//! ## Basic Usage
//!
//! ```no_run
//! use keepsafe_engine::{
//!     CancellationToken, ConflictPolicy, EngineSettings, JobDefinition, JobRunner,
//!     LocalConnector, NullSink, TargetDescriptor,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut job = JobDefinition::new(
//!     "documents",
//!     vec!["/home/me/Documents".into()],
//!     TargetDescriptor::local("/mnt/backup"),
//!     ConflictPolicy::Rename,
//! );
//! job.include = "*.docx;*.xlsx".parse()?;
//! job.exclude = "*/temp/*;*.tmp".parse()?;
//!
//! let settings = EngineSettings::default();
//! let connector = LocalConnector::for_job(&job, &settings);
//! let runner = JobRunner::new(job, connector, settings)?;
//!
//! let result = runner.run(&NullSink, &CancellationToken::new());
//! println!("{}: {} written, {} failed", result.status(), result.files_written(), result.files_failed());
//! for retry in result.failed_items() {
//!     println!("retry later: {}", retry);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Job definitions, plan items, transfer and job results
//! - **error**: Error types by scope
//! - **config**: Engine settings
//! - **matcher**: Include/exclude glob matching
//! - **enumerator**: Lazy source tree walk
//! - **resolver**: Destination conflict resolution
//! - **connector**: Target storage trait and the local filesystem connector
//! - **executor**: Stage, verify, promote for one item
//! - **job**: Job runner state machine
//! - **progress**: Record sink trait and cancellation
//! - **checksums**: Streaming checksum computation

pub mod checksums;
pub mod config;
pub mod connector;
pub mod enumerator;
pub mod error;
pub mod executor;
pub mod job;
pub mod matcher;
pub mod model;
pub mod progress;
pub mod resolver;

// Re-export main types
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::EngineSettings;
pub use connector::{LocalConnector, StagedWrite, TargetConnector};
pub use enumerator::{Enumerator, WalkEntry};
pub use error::{ConnectorError, EngineError, ValidationError};
pub use executor::TransferExecutor;
pub use job::JobRunner;
pub use matcher::{Matcher, PatternList};
pub use model::{
    Candidate, ConflictPolicy, ConnectorKind, EnumerationWarning, JobDefinition, JobResult,
    JobState, PlanAction, PlanItem, ProgressEvent, TargetDescriptor, TransferResult,
    TransferStatus, WarningKind,
};
pub use progress::{CancellationToken, NullSink, RecordSink};
pub use resolver::ConflictResolver;
