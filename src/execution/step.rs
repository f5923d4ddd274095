//! Individual Job Execution
//!
//! Handles the execution of a single job including:
//! - Output and log directory creation
//! - Rendering file outputs to temporary sibling paths
//! - Script generation inside the job's isolation scope
//! - Atomic promotion of temporaries onto their final paths
//!
//! A file output therefore only ever appears at its final path once the
//! command has succeeded, so an interrupted invocation never leaves a
//! partial output that a later run would mistake for a current one.
//!
//! Aborting a job stops its container, if any, then sends SIGTERM to the
//! job's whole process group and SIGKILL once [`KILL_GRACE`] has passed.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
#[cfg(unix)]
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::environment::{ExecutionScope, IsolationSettings};
use crate::error::{EngineError, Result};
use crate::workflow::{Job, NamedPaths};

use super::backend::{AbortHandle, JobExecutor};

/// How often a running child is checked for exit or abort.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time an aborted job gets to exit after SIGTERM before it is killed.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Suffix of the temporary sibling a file output is written to.
const TEMP_SUFFIX: &str = ".ruleflow-tmp";

/// Executes jobs as external processes.
#[derive(Debug, Clone)]
pub struct JobRunner {
    working_dir: PathBuf,
    settings: IsolationSettings,
}

impl JobRunner {
    /// Creates a runner resolving relative job paths against `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>, settings: IsolationSettings) -> Self {
        Self {
            working_dir: working_dir.into(),
            settings,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Runs one job to completion with `threads` substituted for `{threads}`.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - command exited 0 and every declared output is in place
    /// * `Err(Process)` - nonzero exit; temporaries are removed
    /// * `Err(MissingOutput)` - command succeeded without producing an output
    /// * `Err(Environment)` - the isolation scope could not be acquired
    /// * `Err(Interrupted)` - the run was aborted while the job was running
    pub fn run(&self, job: &Job, threads: usize, abort: &AbortHandle) -> Result<()> {
        let label = job.label();

        if abort.is_aborted() {
            return Err(EngineError::Interrupted(label));
        }

        self.ensure_parent_directories(job)?;

        let staged = stage_outputs(job);
        for (_, temp) in &staged {
            remove_stale(&self.resolve(temp))?;
        }
        for dir in &job.bound.directories {
            for marker in &dir.markers {
                remove_stale(&self.resolve(marker))?;
            }
            fs::create_dir_all(self.resolve(&dir.path))?;
        }

        let rendered = rendered_outputs(job, &staged);
        let command_text = job.bound.render_command(&rendered, threads)?;
        debug!("Job {} command: {}", label, command_text);

        let scope = ExecutionScope::acquire(
            job.rule_name(),
            &job.bound.rule.rule().isolation,
            &self.settings,
            &command_text,
        )?;

        let mut command = scope.command(&self.working_dir);
        match job.log() {
            Some(log) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.resolve(log))?;
                command.stdout(Stdio::from(file.try_clone()?));
                command.stderr(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::inherit());
                command.stderr(Stdio::inherit());
            }
        }
        command.stdin(Stdio::null());

        info!("Running {} in {}", label, scope.describe());
        let child = command.spawn()?;
        let status = match wait_or_abort(child, &scope, abort)? {
            Some(status) => status,
            None => {
                warn!("Job {} interrupted", label);
                self.discard(&staged);
                return Err(EngineError::Interrupted(label));
            }
        };
        drop(scope);

        if !status.success() {
            error!("Job {} failed with exit code: {:?}", label, status.code());
            self.discard(&staged);
            return Err(EngineError::Process {
                rule: label,
                code: status.code(),
                log: job.log().map(Path::to_path_buf),
            });
        }

        self.commit(job, &label, &staged)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.working_dir.join(path)
    }

    /// Creates parent directories for outputs and the log.
    fn ensure_parent_directories(&self, job: &Job) -> Result<()> {
        for path in job.outputs().paths().chain(job.log()) {
            if let Some(parent) = self.resolve(path).parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent)?;
                    debug!("Created directory: {}", parent.display());
                }
            }
        }
        Ok(())
    }

    /// Renames every temporary onto its final path, all or nothing.
    fn commit(&self, job: &Job, label: &str, staged: &[(PathBuf, PathBuf)]) -> Result<()> {
        if let Some((final_path, _)) = staged
            .iter()
            .find(|(_, temp)| !self.resolve(temp).exists())
        {
            self.discard(staged);
            return Err(EngineError::MissingOutput {
                rule: label.to_string(),
                path: final_path.clone(),
            });
        }

        for dir in &job.bound.directories {
            if let Some(marker) = dir.markers.iter().find(|m| !self.resolve(m).exists()) {
                self.discard(staged);
                return Err(EngineError::MissingOutput {
                    rule: label.to_string(),
                    path: marker.clone(),
                });
            }
        }

        for (final_path, temp) in staged {
            fs::rename(self.resolve(temp), self.resolve(final_path))?;
            debug!("Committed {}", final_path.display());
        }
        Ok(())
    }

    /// Removes temporaries after a failed or interrupted job.
    fn discard(&self, staged: &[(PathBuf, PathBuf)]) {
        for (_, temp) in staged {
            if let Err(e) = remove_stale(&self.resolve(temp)) {
                warn!("Failed to clean up {}: {}", temp.display(), e);
            }
        }
    }
}

impl JobExecutor for JobRunner {
    fn execute(&self, job: &Job, threads: usize, abort: &AbortHandle) -> Result<()> {
        self.run(job, threads, abort)
    }
}

/// Temporary sibling of a file output: `dir/.name.ruleflow-tmp`.
pub fn temp_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

/// `(final, temporary)` pairs for every file output of `job`.
fn stage_outputs(job: &Job) -> Vec<(PathBuf, PathBuf)> {
    job.outputs()
        .paths()
        .filter(|p| !job.bound.is_directory_output(p))
        .map(|p| (p.to_path_buf(), temp_path(p)))
        .collect()
}

/// Outputs as the command sees them: temporaries for files, finals for directories.
fn rendered_outputs(job: &Job, staged: &[(PathBuf, PathBuf)]) -> NamedPaths {
    let mut rendered = NamedPaths::new();
    for (name, path) in job.outputs().iter() {
        let target = staged
            .iter()
            .find(|(final_path, _)| final_path == path)
            .map(|(_, temp)| temp.as_path())
            .unwrap_or(path);
        rendered.push(name, target);
    }
    rendered
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale file: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Waits for the child, stopping the whole job if the run is aborted.
///
/// Returns `None` when the job was stopped.
fn wait_or_abort(
    mut child: Child,
    scope: &ExecutionScope,
    abort: &AbortHandle,
) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if abort.is_aborted() {
            scope.stop();
            terminate(&mut child)?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Stops the child's process group: SIGTERM, then SIGKILL after the grace period.
#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    // The child leads its own group, so its pid is the group id.
    let group = Pid::from_raw(child.id() as i32);
    signal_group(group, Signal::SIGTERM);

    let deadline = Instant::now() + KILL_GRACE;
    let mut reaped = false;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            reaped = true;
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    // Members that outlived the leader or ignored SIGTERM.
    signal_group(group, Signal::SIGKILL);
    if !reaped {
        child.wait()?;
    }
    Ok(())
}

#[cfg(unix)]
fn signal_group(group: nix::unistd::Pid, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;

    match nix::sys::signal::killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(
            "Failed to send {:?} to process group {}: {}",
            signal,
            group.as_raw(),
            e
        ),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    if let Err(e) = child.kill() {
        warn!("Failed to kill child {}: {}", child.id(), e);
    }
    child.wait()?;
    Ok(())
}
