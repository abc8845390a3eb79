//! Job orchestration module.
//!
//! `JobRunner` drives one job definition through its lifecycle:
//! - Validating the definition and compiling its patterns (`JobRunner::new`)
//! - Planning without writing (`JobRunner::plan`)
//! - Running the transfer (`JobRunner::run`)
//!
//! A run moves `Pending -> Running` and ends in exactly one terminal state.
//! Item-scoped failures are recorded and the run continues. Job-scoped
//! failures (target not ready, missing source root) end the run as `Failed`.
//! Cancellation is observed between items only.
//!
//! All per-run state lives on the stack of `run`, so one runner may be
//! invoked repeatedly and each invocation gets its own run id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::connector::{LocalConnector, TargetConnector};
use crate::enumerator::{Enumerator, WalkEntry};
use crate::error::{EngineError, ValidationError};
use crate::executor::TransferExecutor;
use crate::matcher::Matcher;
use crate::model::{
    Candidate, ConnectorKind, EnumerationWarning, JobDefinition, JobResult, JobState, PlanAction,
    PlanItem, ProgressEvent, TransferResult, TransferStatus,
};
use crate::progress::{CancellationToken, RecordSink};
use crate::resolver::ConflictResolver;

/// Runs one job definition against one target connector.
pub struct JobRunner<C: TargetConnector> {
    definition: JobDefinition,
    connector: C,
    settings: EngineSettings,
    matcher: Matcher,
}

impl JobRunner<LocalConnector> {
    /// Runner whose connector is built from the definition's target
    /// descriptor.
    pub fn for_target(
        definition: JobDefinition,
        settings: EngineSettings,
    ) -> Result<Self, ValidationError> {
        let connector = match definition.target.kind {
            ConnectorKind::Local => LocalConnector::for_job(&definition, &settings),
        };
        JobRunner::new(definition, connector, settings)
    }
}

impl<C: TargetConnector> JobRunner<C> {
    /// Validate the definition and settings. Performs no I/O.
    ///
    /// # Errors
    /// Returns `ValidationError` for a missing source root, an empty target,
    /// an invalid glob, unusable settings, or a local connector rooted
    /// outside the declared target.
    pub fn new(
        definition: JobDefinition,
        connector: C,
        settings: EngineSettings,
    ) -> Result<Self, ValidationError> {
        definition.validate()?;
        settings.validate()?;
        if let Some(root) = connector.local_root() {
            if !root.starts_with(&definition.target.location) {
                return Err(ValidationError::TargetMismatch {
                    declared: definition.target.location.clone(),
                    actual: root.to_path_buf(),
                });
            }
        }
        let matcher = Matcher::new(
            &definition.include,
            &definition.exclude,
            settings.case_sensitive,
        )?;

        Ok(JobRunner {
            definition,
            connector,
            settings,
            matcher,
        })
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The target and staging directories are never enumerated, so a target
    /// under a source root does not back up its own output.
    fn enumerator(&self) -> Enumerator {
        let mut skipped: Vec<PathBuf> = self
            .connector
            .local_root()
            .map(Path::to_path_buf)
            .into_iter()
            .collect();
        skipped.extend(self.settings.staging_dir.clone());
        Enumerator::new(self.definition.sources.clone(), self.matcher.clone())
            .with_selection(self.definition.selected_items.clone())
            .with_skipped_dirs(skipped)
    }

    fn check_sources(&self) -> Result<(), EngineError> {
        for root in &self.definition.sources {
            if !root.exists() {
                return Err(EngineError::SourceRootMissing { path: root.clone() });
            }
        }
        Ok(())
    }

    /// Enumerate and resolve without writing anything.
    ///
    /// Enumeration warnings are logged. Per-item resolution failures abort
    /// the plan, since there is no result to record them in.
    pub fn plan(&self) -> Result<Vec<PlanItem>, EngineError> {
        self.check_sources()?;

        let resolver = ConflictResolver::new(&self.connector, self.definition.conflict_policy);
        let enumerator = self.enumerator();
        let mut items = Vec::new();
        for entry in enumerator.walk() {
            match entry {
                WalkEntry::Warning(w) => {
                    warn!(path = %w.path.display(), kind = ?w.kind, "{}", w.message);
                }
                WalkEntry::Candidate(candidate) => items.push(resolver.resolve(candidate)?),
            }
        }
        Ok(items)
    }

    /// Execute the job. Always returns a `JobResult`, and reports it to the
    /// sink exactly once.
    pub fn run(&self, sink: &dyn RecordSink, cancel: &CancellationToken) -> JobResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut state = JobState::Pending;

        info!(
            %run_id,
            job = %self.definition.name,
            target = %self.connector.describe(),
            policy = %self.definition.conflict_policy,
            "job started"
        );
        state = transition(run_id, state, JobState::Running);

        let mut items: Vec<TransferResult> = Vec::new();
        let mut warnings: Vec<EnumerationWarning> = Vec::new();

        let preflight = self
            .connector
            .check_ready()
            .map_err(EngineError::from)
            .and_then(|()| self.check_sources());
        if let Err(e) = preflight {
            warn!(%run_id, error = %e, "job cannot start");
            state = transition(run_id, state, JobState::Failed);
            return self.finish(sink, run_id, state, started_at, Some(e.to_string()), items, warnings);
        }

        let resolver = ConflictResolver::new(&self.connector, self.definition.conflict_policy);
        let executor = TransferExecutor::new(&self.connector, &self.settings);
        let enumerator = self.enumerator();
        let mut walk = enumerator.walk();

        let mut bytes_done: u64 = 0;
        let mut cancelled = false;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let Some(entry) = walk.next() else {
                break;
            };

            let candidate = match entry {
                WalkEntry::Warning(w) => {
                    warn!(%run_id, path = %w.path.display(), kind = ?w.kind, "{}", w.message);
                    sink.on_warning(&w);
                    warnings.push(w);
                    continue;
                }
                WalkEntry::Candidate(candidate) => candidate,
            };

            let current = candidate.source_path.clone();
            let result = match resolver.resolve(candidate.clone()) {
                Ok(item) => executor.execute(run_id, &item),
                Err(e) => {
                    warn!(%run_id, path = %current.display(), error = %e, "conflict resolution failed");
                    unresolved(run_id, candidate, &e)
                }
            };

            bytes_done += result.bytes_transferred();
            sink.on_item_result(&result);
            items.push(result);

            let done = items.len() as u64;
            sink.on_progress(&ProgressEvent {
                run_id,
                items_done: done,
                items_total_so_far: done,
                bytes_done,
                current,
            });
        }

        let terminal = if cancelled {
            info!(%run_id, processed = items.len(), "cancellation observed");
            JobState::Aborted
        } else if items.iter().any(|r| r.status().is_failure()) {
            JobState::CompletedWithErrors
        } else {
            JobState::Completed
        };
        state = transition(run_id, state, terminal);

        self.finish(sink, run_id, state, started_at, None, items, warnings)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        sink: &dyn RecordSink,
        run_id: Uuid,
        state: JobState,
        started_at: chrono::DateTime<Utc>,
        error: Option<String>,
        items: Vec<TransferResult>,
        warnings: Vec<EnumerationWarning>,
    ) -> JobResult {
        let result = JobResult::finalize(
            run_id,
            self.definition.name.clone(),
            state,
            started_at,
            error,
            items,
            warnings,
        );
        info!(
            %run_id,
            status = %result.status(),
            written = result.files_written(),
            skipped = result.files_skipped(),
            failed = result.files_failed(),
            bytes = result.bytes_transferred(),
            "job finished"
        );
        sink.on_job_result(&result);
        result
    }
}

fn transition(run_id: Uuid, from: JobState, to: JobState) -> JobState {
    debug_assert!(!from.is_terminal(), "terminal state {} is final", from);
    debug!(%run_id, %from, %to, "job state");
    to
}

/// Result for a candidate that never got a destination.
fn unresolved(run_id: Uuid, candidate: Candidate, err: &crate::error::ConnectorError) -> TransferResult {
    let item = PlanItem {
        destination: candidate.relative_path.clone(),
        candidate,
        action: PlanAction::Write,
        replace_existing: false,
    };
    TransferResult::failed(
        run_id,
        &item,
        TransferStatus::WriteFailed,
        0,
        err.to_string(),
        err.raw_os_error(),
        Duration::ZERO,
    )
}
