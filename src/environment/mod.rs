//! Environment Management Module
//!
//! Isolation scopes jobs execute in: the host, an existing
//! conda/micromamba environment, or a container image.

pub mod conda;
pub mod container;
pub mod scope;

pub use conda::{MAMBA_ROOT_PREFIX, MICROMAMBA_PATH};
pub use scope::{locate_binary, ExecutionScope, IsolationSettings};
