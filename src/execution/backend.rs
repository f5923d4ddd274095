//! Pluggable job executor abstraction.
//!
//! The scheduler talks to a [`JobExecutor`] instead of spawning processes
//! itself. Production code uses [`JobRunner`](super::step::JobRunner); tests
//! provide their own implementation that records dispatches without running
//! anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::workflow::Job;

/// Trait abstracting how a single job is executed.
///
/// Called concurrently from worker threads, one job per call.
pub trait JobExecutor: Send + Sync {
    /// Runs `job` to completion on `threads` threads, the weight the
    /// scheduler granted it.
    ///
    /// Implementations must return promptly with
    /// [`EngineError::Interrupted`](crate::EngineError::Interrupted) once
    /// `abort` is raised.
    fn execute(&self, job: &Job, threads: usize, abort: &AbortHandle) -> Result<()>;
}

/// Run-level cancellation flag shared by the scheduler, the workers and
/// signal handlers.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the run to stop. Idempotent.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
