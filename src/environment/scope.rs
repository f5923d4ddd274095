//! Per-Job Isolation Scopes
//!
//! An [`ExecutionScope`] is acquired for exactly one job and owns a private
//! scratch directory holding the generated job script. Dropping the scope
//! releases it, whichever way the job ended.
//!
//! On Unix the job is spawned as the leader of its own process group, so
//! everything the script starts can be signalled together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use ruleflow::environment::{ExecutionScope, IsolationSettings};
//! use ruleflow::workflow::Isolation;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = IsolationSettings::default();
//!     let scope = ExecutionScope::acquire("convert", &Isolation::None, &settings, "echo hi")?;
//!     let status = scope.command(Path::new(".")).status()?;
//!     assert!(status.success());
//!     Ok(())
//! }
//! ```

use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use tempfile::TempDir;

use crate::environment::{conda, container};
use crate::error::{EngineError, Result};
use crate::workflow::{ContainerRuntime, Isolation, PipelineConfig};

/// Which isolation kinds this invocation honours.
///
/// A rule asking for an isolation kind that is not enabled runs on the host.
#[derive(Debug, Clone, Default)]
pub struct IsolationSettings {
    pub use_conda: bool,
    pub use_containers: bool,
    pub container_runtime: ContainerRuntime,
    pub conda_frontend: Option<PathBuf>,
}

impl IsolationSettings {
    pub fn from_config(config: &PipelineConfig, use_conda: bool, use_containers: bool) -> Self {
        Self {
            use_conda,
            use_containers,
            container_runtime: config.container_runtime,
            conda_frontend: config.conda_frontend.as_ref().map(PathBuf::from),
        }
    }
}

#[derive(Debug)]
enum Launcher {
    Host,
    Conda { frontend: PathBuf, env: String },
    Container { binary: PathBuf, runtime: ContainerRuntime, image: String },
}

/// The isolation a single job runs in.
#[derive(Debug)]
pub struct ExecutionScope {
    rule: String,
    launcher: Launcher,
    script: PathBuf,
    // Removed on drop, after the script has run.
    scratch: TempDir,
}

impl ExecutionScope {
    /// Prepares the scope and writes the job script into it.
    ///
    /// Fails with [`EngineError::Environment`] when the requested
    /// environment or container runtime is unavailable.
    pub fn acquire(
        rule: &str,
        isolation: &Isolation,
        settings: &IsolationSettings,
        command: &str,
    ) -> Result<Self> {
        let launcher = match isolation {
            Isolation::Conda(env_name) if settings.use_conda => {
                let frontend = conda::resolve_frontend(settings.conda_frontend.as_deref())
                    .ok_or_else(|| EngineError::Environment {
                        rule: rule.to_string(),
                        reason: "no conda frontend (micromamba) available".to_string(),
                    })?;
                let exists = conda::check_env(&frontend, env_name).map_err(|e| match e {
                    EngineError::Environment { reason, .. } => EngineError::Environment {
                        rule: rule.to_string(),
                        reason,
                    },
                    other => other,
                })?;
                if !exists {
                    return Err(EngineError::Environment {
                        rule: rule.to_string(),
                        reason: format!("conda environment '{}' does not exist", env_name),
                    });
                }
                Launcher::Conda {
                    frontend,
                    env: env_name.clone(),
                }
            }
            Isolation::Container(image) if settings.use_containers => {
                let runtime = settings.container_runtime;
                let binary = locate_binary(runtime.binary()).ok_or_else(|| {
                    EngineError::Environment {
                        rule: rule.to_string(),
                        reason: format!(
                            "container runtime '{}' not found on PATH",
                            runtime.binary()
                        ),
                    }
                })?;
                Launcher::Container {
                    binary,
                    runtime,
                    image: image.clone(),
                }
            }
            _ => Launcher::Host,
        };

        let scratch = tempfile::Builder::new()
            .prefix(&format!("ruleflow-{}-", rule))
            .tempdir()?;
        let script = create_execution_script(scratch.path(), command)?;

        debug!("Acquired {:?} scope for '{}' ({})", launcher, rule, scratch.path().display());

        Ok(Self {
            rule: rule.to_string(),
            launcher,
            script,
            scratch,
        })
    }

    /// Path of the generated job script.
    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Short description for logs, e.g. `conda:proteomics`.
    pub fn describe(&self) -> String {
        match &self.launcher {
            Launcher::Host => "host".to_string(),
            Launcher::Conda { env, .. } => format!("conda:{}", env),
            Launcher::Container { image, .. } => format!("container:{}", image),
        }
    }

    /// Name given to the job's container, unique per scope.
    pub fn container_name(&self) -> String {
        self.scratch
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("ruleflow-{}", self.rule))
    }

    /// Stops work the job left outside its own process group: a docker or
    /// podman container. A no-op for other launchers.
    pub fn stop(&self) {
        if let Launcher::Container { binary, runtime, .. } = &self.launcher {
            container::kill(binary, *runtime, &self.container_name());
        }
    }

    /// The process to spawn, running in `working_dir`.
    pub fn command(&self, working_dir: &Path) -> Command {
        let mut cmd = match &self.launcher {
            Launcher::Host => {
                let mut cmd = Command::new("bash");
                cmd.arg(&self.script);
                cmd
            }
            Launcher::Conda { frontend, env } => conda::run_command(frontend, env, &self.script),
            Launcher::Container {
                binary,
                runtime,
                image,
            } => container::run_command(
                binary,
                *runtime,
                image,
                &self.container_name(),
                working_dir,
                &self.script,
            ),
        };
        cmd.current_dir(working_dir);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        debug!(
            "Released scope for '{}' ({})",
            self.rule,
            self.scratch.path().display()
        );
    }
}

/// Writes the bash script a job executes.
fn create_execution_script(dir: &Path, command_text: &str) -> Result<PathBuf> {
    let script_path = dir.join("job.sh");
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -euo pipefail")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Finds an executable by explicit path or on `PATH`.
pub fn locate_binary(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
