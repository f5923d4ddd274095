//! Pipeline Configuration
//!
//! The single immutable value threaded into rule registration and pattern
//! resolution. It carries the enumerations targets are expanded over and the
//! locations of external tools.
//!
//! # Example YAML Format
//!
//! ```yaml
//! enumerations:
//!   db: [human, yeast]
//!   dataset: [run_01, run_02]
//! tools:
//!   msconvert: /opt/pwiz/msconvert
//!   comet: comet.exe
//! container_runtime: docker
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use log::{debug, info};
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::workflow::wildcards::Enumerations;

/// Container engine used for [`Isolation::Container`](crate::workflow::Isolation) rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
    Apptainer,
    Singularity,
}

impl ContainerRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Apptainer => "apptainer",
            ContainerRuntime::Singularity => "singularity",
        }
    }
}

/// Immutable pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Named value lists that wildcards expand over
    #[serde(default)]
    pub enumerations: Enumerations,

    /// External tool name -> executable location
    #[serde(default)]
    pub tools: BTreeMap<String, String>,

    /// Container engine for container-isolated rules
    #[serde(default)]
    pub container_runtime: ContainerRuntime,

    /// Explicit conda frontend binary (defaults to the resolved micromamba)
    #[serde(default)]
    pub conda_frontend: Option<String>,

    /// Modification time of the file this configuration was read from
    #[serde(skip)]
    pub declared_at: Option<SystemTime>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading pipeline configuration from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read configuration '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.declared_at = fs::metadata(path).and_then(|m| m.modified()).ok();

        debug!(
            "Configuration: {} enumerations, {} tools",
            config.enumerations.len(),
            config.tools.len()
        );
        Ok(config)
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: PipelineConfig = serde_yaml::from_str(content).map_err(|e| {
            EngineError::Config(format!("Failed to parse configuration YAML: {}", e))
        })?;

        for (name, values) in &config.enumerations {
            if values.is_empty() {
                return Err(EngineError::Config(format!(
                    "enumeration '{}' has no values",
                    name
                )));
            }
            if let Some(bad) = values.iter().find(|v| v.is_empty() || v.contains('/')) {
                return Err(EngineError::Config(format!(
                    "enumeration '{}' contains invalid value '{}'",
                    name, bad
                )));
            }
        }
        Ok(config)
    }

    pub fn with_enumeration<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enumerations
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.tools.insert(name.into(), location.into());
        self
    }

    /// Location of an external tool, defaulting to its bare name (PATH lookup).
    pub fn tool(&self, name: &str) -> String {
        self.tools
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn enumeration(&self, name: &str) -> Option<&[String]> {
        self.enumerations.get(name).map(|v| v.as_slice())
    }
}
