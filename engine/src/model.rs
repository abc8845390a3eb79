//! Core data model for backup runs.
//!
//! This module defines the data flowing through one run:
//! - JobDefinition: the caller's immutable description of what to back up
//! - Candidate: one discovered source file
//! - PlanItem: a candidate plus its resolved destination and action
//! - TransferResult: the outcome of one plan item
//! - JobResult: the aggregate outcome of one run
//! - ProgressEvent, EnumerationWarning: events emitted while running

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, ValidationError};
use crate::matcher::PatternList;

/// Policy for handling a destination that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Replace the existing file once the new one is verified
    Overwrite,
    /// Write next to it as `name (N).ext`
    Rename,
    /// Leave the existing file alone
    Skip,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Overwrite => write!(f, "overwrite"),
            ConflictPolicy::Rename => write!(f, "rename"),
            ConflictPolicy::Skip => write!(f, "skip"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "rename" => Ok(ConflictPolicy::Rename),
            "skip" => Ok(ConflictPolicy::Skip),
            _ => Err(ValidationError::UnknownValue {
                field: "conflict policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Which connector implementation serves a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    Local,
}

/// Where a job writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    #[serde(default = "default_connector_kind")]
    pub kind: ConnectorKind,
    pub location: PathBuf,
}

fn default_connector_kind() -> ConnectorKind {
    ConnectorKind::Local
}

impl TargetDescriptor {
    pub fn local(location: impl Into<PathBuf>) -> Self {
        TargetDescriptor {
            kind: ConnectorKind::Local,
            location: location.into(),
        }
    }
}

/// A configured backup task. Never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Display name; also the folder name when `job_folder` is enabled
    #[serde(default)]
    pub name: String,

    /// Files or directories to back up
    pub sources: Vec<PathBuf>,

    /// Include globs; empty means everything
    #[serde(default)]
    pub include: PatternList,

    /// Exclude globs, applied after include
    #[serde(default)]
    pub exclude: PatternList,

    pub target: TargetDescriptor,

    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: ConflictPolicy,

    /// When set, only these relative paths are considered (item-list re-run)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_items: Option<BTreeSet<String>>,
}

fn default_conflict_policy() -> ConflictPolicy {
    ConflictPolicy::Rename
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        sources: Vec<PathBuf>,
        target: TargetDescriptor,
        conflict_policy: ConflictPolicy,
    ) -> Self {
        JobDefinition {
            name: name.into(),
            sources,
            include: PatternList::default(),
            exclude: PatternList::default(),
            target,
            conflict_policy,
            selected_items: None,
        }
    }

    /// Load a job definition from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&raw).map_err(|e| EngineError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check the definition can be run. Performs no I/O.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sources.is_empty() || self.sources.iter().all(|s| s.as_os_str().is_empty()) {
            return Err(ValidationError::NoSourceRoots);
        }
        if self.target.location.as_os_str().is_empty() {
            return Err(ValidationError::EmptyTarget);
        }
        Ok(())
    }

    /// Copy of this definition restricted to the given relative paths.
    pub fn restricted_to<I, S>(&self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut job = self.clone();
        job.selected_items = Some(items.into_iter().map(Into::into).collect());
        job
    }
}

/// A discovered source file eligible for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Absolute (or caller-given) path of the source file
    pub source_path: PathBuf,

    /// Path relative to its source root; the destination is derived from it
    pub relative_path: PathBuf,

    /// Size at enumeration time (informational)
    pub size: u64,

    pub modified: Option<SystemTime>,

    /// True when reached through a symbolic link
    pub via_link: bool,
}

impl Candidate {
    /// Relative path with `/` separators, as seen by the matcher.
    pub fn relative_str(&self) -> String {
        normalize_relative(&self.relative_path)
    }
}

/// Render a relative path with `/` separators regardless of platform.
pub fn normalize_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// What the executor should do with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "suffix")]
pub enum PlanAction {
    /// Write to the candidate's natural destination
    Write,
    /// Leave the destination alone
    Skip,
    /// Write to `name (suffix).ext`
    RenameTo(u32),
}

impl PlanAction {
    pub fn writes(&self) -> bool {
        !matches!(self, PlanAction::Skip)
    }
}

/// A candidate with its resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub candidate: Candidate,

    /// Destination path relative to the target root
    pub destination: PathBuf,

    pub action: PlanAction,

    /// Whether promotion may replace an existing destination file
    pub replace_existing: bool,
}

/// Outcome status of one plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Succeeded,
    VerificationFailed,
    WriteFailed,
    Skipped,
}

impl TransferStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TransferStatus::VerificationFailed | TransferStatus::WriteFailed
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Succeeded => write!(f, "succeeded"),
            TransferStatus::VerificationFailed => write!(f, "verification-failed"),
            TransferStatus::WriteFailed => write!(f, "write-failed"),
            TransferStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-item outcome. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    run_id: Uuid,
    source_path: PathBuf,
    relative_path: String,
    destination: PathBuf,
    action: PlanAction,
    status: TransferStatus,
    bytes_transferred: u64,
    checksum: Option<String>,
    error: Option<String>,
    error_code: Option<i32>,
    elapsed_ms: u64,
}

impl TransferResult {
    fn from_item(run_id: Uuid, item: &PlanItem, status: TransferStatus, elapsed: Duration) -> Self {
        TransferResult {
            run_id,
            source_path: item.candidate.source_path.clone(),
            relative_path: item.candidate.relative_str(),
            destination: item.destination.clone(),
            action: item.action,
            status,
            bytes_transferred: 0,
            checksum: None,
            error: None,
            error_code: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn succeeded(
        run_id: Uuid,
        item: &PlanItem,
        bytes: u64,
        checksum: String,
        elapsed: Duration,
    ) -> Self {
        TransferResult {
            bytes_transferred: bytes,
            checksum: Some(checksum),
            ..Self::from_item(run_id, item, TransferStatus::Succeeded, elapsed)
        }
    }

    pub fn skipped(run_id: Uuid, item: &PlanItem) -> Self {
        Self::from_item(run_id, item, TransferStatus::Skipped, Duration::ZERO)
    }

    pub fn failed(
        run_id: Uuid,
        item: &PlanItem,
        status: TransferStatus,
        bytes: u64,
        error: String,
        error_code: Option<i32>,
        elapsed: Duration,
    ) -> Self {
        debug_assert!(status.is_failure());
        TransferResult {
            bytes_transferred: bytes,
            error: Some(error),
            error_code,
            ..Self::from_item(run_id, item, status, elapsed)
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Destination relative to the target root.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn action(&self) -> PlanAction {
        self.action
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Bytes actually streamed to staging (not the enumerated size).
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Hex digest of the written content.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error_code
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// State of a run. The last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Aborted,
    Failed,
}

impl JobState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::CompletedWithErrors => write!(f, "completed-with-errors"),
            JobState::Aborted => write!(f, "aborted"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Kinds of non-fatal enumeration problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Directory could not be read; its subtree was skipped
    Unreadable,
    /// Entry metadata could not be read (vanished, broken link)
    Inaccessible,
    /// Link target already visited in this enumeration
    LinkCycle,
}

/// A per-path enumeration warning. The walk continues past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationWarning {
    pub path: PathBuf,
    pub kind: WarningKind,
    pub message: String,
}

/// Emitted after every processed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub items_done: u64,
    pub items_total_so_far: u64,
    pub bytes_done: u64,
    pub current: PathBuf,
}

/// Aggregate outcome of one run. Built only by the job runner.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    run_id: Uuid,
    job_name: String,
    status: JobState,
    files_considered: u64,
    files_written: u64,
    files_skipped: u64,
    files_failed: u64,
    bytes_transferred: u64,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    error: Option<String>,
    items: Vec<TransferResult>,
    warnings: Vec<EnumerationWarning>,
}

impl JobResult {
    /// Counts are derived from `items` so they always agree with them.
    pub(crate) fn finalize(
        run_id: Uuid,
        job_name: String,
        status: JobState,
        started_at: DateTime<Utc>,
        error: Option<String>,
        items: Vec<TransferResult>,
        warnings: Vec<EnumerationWarning>,
    ) -> Self {
        debug_assert!(status.is_terminal());
        let mut written = 0;
        let mut skipped = 0;
        let mut failed = 0;
        let mut bytes = 0;
        for item in &items {
            match item.status() {
                TransferStatus::Succeeded => written += 1,
                TransferStatus::Skipped => skipped += 1,
                TransferStatus::VerificationFailed | TransferStatus::WriteFailed => failed += 1,
            }
            bytes += item.bytes_transferred();
        }

        JobResult {
            run_id,
            job_name,
            status,
            files_considered: items.len() as u64,
            files_written: written,
            files_skipped: skipped,
            files_failed: failed,
            bytes_transferred: bytes,
            started_at,
            finished_at: Utc::now(),
            error,
            items,
            warnings,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn status(&self) -> JobState {
        self.status
    }

    pub fn files_considered(&self) -> u64 {
        self.files_considered
    }

    pub fn files_written(&self) -> u64 {
        self.files_written
    }

    pub fn files_skipped(&self) -> u64 {
        self.files_skipped
    }

    pub fn files_failed(&self) -> u64 {
        self.files_failed
    }

    /// Sum of bytes written across items, failed partial copies included.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Job-scoped error for Failed runs.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn items(&self) -> &[TransferResult] {
        &self.items
    }

    pub fn warnings(&self) -> &[EnumerationWarning] {
        &self.warnings
    }

    /// Relative paths of failed items, for an item-list re-run.
    pub fn failed_items(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.status().is_failure())
            .map(|i| i.relative_path().to_string())
            .collect()
    }
}
