//! Run Monitoring Module
//!
//! Provides utilities for tracking and reporting job execution.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Job start/end timing for Gantt charts
//! - [`summary`]: Terminal and JSON run summaries

pub mod summary;
pub mod timeline;

pub use summary::{render, RunSummary};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
