//! Container Execution
//!
//! Runs job scripts inside a container image. The working directory and the
//! directory holding the job script are mounted at identical paths, so every
//! relative path a job renders resolves the same way inside and outside the
//! container.
//!
//! Docker and Podman run the container detached from the client process, so
//! each container is named after its job scope and stopped by name when the
//! run is aborted.

use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, warn};

use crate::workflow::ContainerRuntime;

/// Arguments passed to the runtime binary, excluding the binary itself.
///
/// `name` is the container name; Apptainer and Singularity run the image as
/// a plain child process and ignore it.
pub fn container_args(
    runtime: ContainerRuntime,
    image: &str,
    name: &str,
    working_dir: &Path,
    script: &Path,
) -> Vec<String> {
    let work = working_dir.display().to_string();
    let script_dir = script
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| work.clone());

    let mut args = Vec::new();
    match runtime {
        ContainerRuntime::Docker | ContainerRuntime::Podman => {
            args.extend(["run".to_string(), "--rm".to_string()]);
            args.extend(["--name".to_string(), name.to_string()]);
            args.extend(["-v".to_string(), format!("{}:{}", work, work)]);
            if script_dir != work {
                args.extend(["-v".to_string(), format!("{}:{}:ro", script_dir, script_dir)]);
            }
            args.extend(["-w".to_string(), work]);
            args.push(image.to_string());
        }
        ContainerRuntime::Apptainer | ContainerRuntime::Singularity => {
            args.push("exec".to_string());
            args.extend(["--bind".to_string(), work.clone()]);
            if script_dir != work {
                args.extend(["--bind".to_string(), script_dir]);
            }
            args.extend(["--pwd".to_string(), work]);
            args.push(image.to_string());
        }
    }
    args.push("bash".to_string());
    args.push(script.display().to_string());
    args
}

/// Builds the command running `script` inside `image`.
pub fn run_command(
    binary: &Path,
    runtime: ContainerRuntime,
    image: &str,
    name: &str,
    working_dir: &Path,
    script: &Path,
) -> Command {
    let mut cmd = Command::new(binary);
    cmd.args(container_args(runtime, image, name, working_dir, script));
    cmd
}

/// Arguments stopping the named container, if the runtime detaches it.
pub fn kill_args(runtime: ContainerRuntime, name: &str) -> Option<Vec<String>> {
    match runtime {
        ContainerRuntime::Docker | ContainerRuntime::Podman => {
            Some(vec!["kill".to_string(), name.to_string()])
        }
        ContainerRuntime::Apptainer | ContainerRuntime::Singularity => None,
    }
}

/// Stops the named container. A container that already exited is not an error.
pub fn kill(binary: &Path, runtime: ContainerRuntime, name: &str) {
    let Some(args) = kill_args(runtime, name) else {
        return;
    };
    match Command::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!("Killed container {}", name),
        Ok(status) => debug!("Container {} already gone ({})", name, status),
        Err(e) => warn!("Failed to run {} kill {}: {}", binary.display(), name, e),
    }
}
