//! RuleFlow - Wildcard-Driven Pipeline Build Engine
//!
//! Builds file-based scientific pipelines from declarative rules. Each rule
//! names input and output path templates with `{wildcards}`; requesting a
//! concrete target path resolves the rule producing it, recursively, into a
//! job graph that is then executed in parallel, rerunning only what is stale.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Rules, templates, path resolution and graph construction
//! - [`execution`]: Scheduler and per-job execution
//! - [`environment`]: Host, conda and container isolation scopes
//! - [`monitoring`]: Execution timeline and run summaries
//!
//! [`pipeline`] declares the bundled proteomics pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ruleflow::environment::IsolationSettings;
//! use ruleflow::execution::{Engine, JobRunner};
//! use ruleflow::workflow::{DagBuilder, FileSnapshot, PipelineConfig, Rule, RuleRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(PipelineConfig::new().with_enumeration("sample", ["a", "b"]));
//!
//!     let mut registry = RuleRegistry::new(config);
//!     registry.register(
//!         Rule::new("count", "wc -l {input} > {output}")
//!             .with_input("reads", "reads/{sample}.txt")
//!             .with_output("counts", "counts/{sample}.txt"),
//!     )?;
//!
//!     let targets = registry.expand("counts/{sample}.txt")?;
//!     let working_dir = std::env::current_dir()?;
//!     let dag = DagBuilder::new(&registry, FileSnapshot::live_in(&working_dir)).build(&targets)?;
//!
//!     let runner = JobRunner::new(working_dir, IsolationSettings::default());
//!     let mut engine = Engine::new(dag, Arc::new(runner));
//!     engine.set_max_weight(4);
//!
//!     let report = engine.run()?;
//!     assert!(report.is_success());
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pipeline;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use execution::{AbortHandle, Engine, JobRunner, RunReport};
pub use workflow::{DagBuilder, FileSnapshot, PipelineConfig, Rule, RuleRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RuleFlow";
