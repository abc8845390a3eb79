//! Destination conflict resolution.
//!
//! Existence is always asked of the target connector. Names handed out
//! during a run are also recorded in a reservation set, and the
//! check-then-claim step runs under that set's lock, so two in-flight items
//! can never be given the same destination.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::connector::TargetConnector;
use crate::error::ConnectorError;
use crate::model::{Candidate, ConflictPolicy, PlanAction, PlanItem};

/// Upper bound on `name (N).ext` attempts.
pub const MAX_RENAME_ATTEMPTS: u32 = 10_000;

/// Resolves candidates against one target for one run.
pub struct ConflictResolver<'a, C: TargetConnector> {
    connector: &'a C,
    policy: ConflictPolicy,
    claimed: Mutex<HashSet<PathBuf>>,
}

impl<'a, C: TargetConnector> ConflictResolver<'a, C> {
    pub fn new(connector: &'a C, policy: ConflictPolicy) -> Self {
        ConflictResolver {
            connector,
            policy,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Decide destination and action for a candidate.
    pub fn resolve(&self, candidate: Candidate) -> Result<PlanItem, ConnectorError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        let natural = candidate.relative_path.clone();

        let taken = |claimed: &HashSet<PathBuf>, path: &Path| -> Result<bool, ConnectorError> {
            Ok(claimed.contains(path) || self.connector.exists(path)?)
        };

        let (destination, action, replace_existing) = match self.policy {
            ConflictPolicy::Skip => {
                if taken(&*claimed, &natural)? {
                    (natural, PlanAction::Skip, false)
                } else {
                    (natural, PlanAction::Write, false)
                }
            }
            ConflictPolicy::Overwrite => (natural, PlanAction::Write, true),
            ConflictPolicy::Rename => {
                if !taken(&*claimed, &natural)? {
                    (natural, PlanAction::Write, false)
                } else {
                    let mut found = None;
                    for n in 1..=MAX_RENAME_ATTEMPTS {
                        let alternative = suffixed_path(&natural, n);
                        if !taken(&*claimed, &alternative)? {
                            found = Some((alternative, n));
                            break;
                        }
                    }
                    let (path, n) = found.ok_or_else(|| ConnectorError::NamesExhausted {
                        path: natural.clone(),
                        attempts: MAX_RENAME_ATTEMPTS,
                    })?;
                    (path, PlanAction::RenameTo(n), false)
                }
            }
        };

        if action.writes() {
            claimed.insert(destination.clone());
        }

        Ok(PlanItem {
            candidate,
            destination,
            action,
            replace_existing,
        })
    }
}

/// `dir/name.ext` -> `dir/name (n).ext`
pub fn suffixed_path(path: &Path, n: u32) -> PathBuf {
    let mut name: OsString = path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(format!(" ({})", n));
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}
