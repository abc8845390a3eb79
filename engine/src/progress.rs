//! Run reporting and cancellation.
//!
//! This module defines the RecordSink trait, which decouples the job runner
//! from whatever records its output (CLI, history store, UI).
//!
//! Sinks observe a run; they never steer it. Cancellation goes through a
//! separate [`CancellationToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::model::{EnumerationWarning, JobResult, ProgressEvent, TransferResult};

/// Receives everything a run produces.
///
/// All methods are called synchronously from the runner, in order, for a
/// single run. Every value carries the run id it belongs to.
pub trait RecordSink: Send + Sync {
    /// Called after every processed item.
    fn on_progress(&self, event: &ProgressEvent);

    /// Called once per item, before the matching progress event.
    fn on_item_result(&self, result: &TransferResult);

    /// Called for each non-fatal enumeration problem.
    fn on_warning(&self, _warning: &EnumerationWarning) {}

    /// Called exactly once per run, whatever the terminal state.
    fn on_job_result(&self, result: &JobResult);
}

/// Sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn on_progress(&self, _event: &ProgressEvent) {}
    fn on_item_result(&self, _result: &TransferResult) {}
    fn on_job_result(&self, _result: &JobResult) {}
}

/// Cooperative cancellation flag, checked by the runner between items.
///
/// Clones share the same flag, so one can be handed to a signal handler.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
