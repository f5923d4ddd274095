//! Engine Error Taxonomy
//!
//! Build-time errors (`Pattern`, `AmbiguousRule`, `Cycle`, `MissingInput`)
//! abort an invocation before any job runs. Runtime errors (`Process`,
//! `Environment`, `MissingOutput`, `Interrupted`) are scoped to a single job
//! and the jobs depending on it.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while registering rules, building the job graph or running jobs.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A rule template is malformed or cannot be parsed back into wildcards.
    #[error("Pattern error in '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    /// Two rules (or two bindings of one template) can produce the same path.
    #[error("Ambiguous rule: {0}")]
    AmbiguousRule(String),

    /// Dependency resolution revisited a job that is still under construction.
    #[error("Cyclic dependency: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// A required leaf path neither exists nor is producible by any rule.
    #[error("Missing input '{}'{}", path.display(), required_by.as_ref().map(|r| format!(" (required by rule '{}')", r)).unwrap_or_default())]
    MissingInput {
        path: PathBuf,
        required_by: Option<String>,
    },

    /// An external command exited with a nonzero status.
    #[error("Rule '{rule}' failed with exit code {}{}", code.map(|c| c.to_string()).unwrap_or_else(|| "<signal>".to_string()), log.as_ref().map(|l| format!(", see log {}", l.display())).unwrap_or_default())]
    Process {
        rule: String,
        code: Option<i32>,
        log: Option<PathBuf>,
    },

    /// An isolation scope could not be acquired or released.
    #[error("Environment error for rule '{rule}': {reason}")]
    Environment { rule: String, reason: String },

    /// The command succeeded but did not produce a declared output.
    #[error("Rule '{rule}' did not produce declared output '{}'", path.display())]
    MissingOutput { rule: String, path: PathBuf },

    /// The run was aborted while the job was in flight.
    #[error("Rule '{0}' was interrupted")]
    Interrupted(String),

    /// The pipeline configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that can only arise before execution starts.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::Pattern { .. }
                | Self::AmbiguousRule(_)
                | Self::Cycle { .. }
                | Self::MissingInput { .. }
                | Self::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
