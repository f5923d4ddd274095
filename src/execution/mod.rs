//! Job Execution Module
//!
//! Drives a job graph to completion.
//!
//! # Architecture
//!
//! - [`engine`]: Scheduler owning job states and the worker pool
//! - [`backend`]: Executor seam and the run-level abort flag
//! - [`step`]: Execution of a single job as an external process

pub mod backend;
pub mod engine;
pub mod step;

pub use backend::{AbortHandle, JobExecutor};
pub use engine::{Engine, JobReport, JobState, RunReport, SkipReason};
pub use step::JobRunner;
