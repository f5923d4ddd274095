//! Workflow Definition Module
//!
//! Provides the data structures for declaring rules and turning requested
//! target paths into a job graph.
//!
//! # Structure
//!
//! - [`wildcards`]: Path templates, matching and expansion
//! - [`model`]: Rule declarations and their bound form
//! - [`config`]: Immutable pipeline configuration
//! - [`registry`]: Rule registration and path resolution
//! - [`snapshot`]: Filesystem metadata and staleness
//! - [`graph`]: Job graph construction

pub mod config;
pub mod graph;
pub mod model;
pub mod registry;
pub mod snapshot;
pub mod wildcards;

pub use config::{ContainerRuntime, PipelineConfig};
pub use graph::{Dag, DagBuilder, Job, JobId};
pub use model::{BoundRule, CompiledRule, Isolation, NamedPaths, Param, Rule};
pub use registry::RuleRegistry;
pub use snapshot::{FileSnapshot, Staleness};
pub use wildcards::{expand, has_wildcards, Enumerations, Template, Wildcards};
