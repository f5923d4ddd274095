//! Conda/Micromamba Environment Integration
//!
//! Runs job scripts inside existing micromamba environments. Environments
//! are never created here; a missing environment is an
//! [`EngineError::Environment`].
//!
//! # Frontend Resolution Priority
//!
//! The micromamba binary is resolved in the following order:
//! 1. `conda_frontend` from the pipeline configuration
//! 2. Next to the ruleflow executable
//! 3. System PATH

use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::environment::scope::locate_binary;
use crate::error::{EngineError, Result};

/// Lazily-resolved micromamba binary, `None` when nothing was found.
pub static MICROMAMBA_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let bundled = exe_dir.join("micromamba");
        if bundled.exists() {
            info!("Using bundled micromamba: {}", bundled.display());
            return Some(bundled);
        }
    }

    match locate_binary("micromamba") {
        Some(path) => {
            info!("Using system micromamba: {}", path.display());
            Some(path)
        }
        None => {
            warn!("Micromamba binary not found next to the executable or on PATH");
            None
        }
    }
});

/// Root prefix environments are looked up in.
///
/// An explicit `MAMBA_ROOT_PREFIX` wins; otherwise `~/.ruleflow/micromamba`.
pub static MAMBA_ROOT_PREFIX: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(prefix) = std::env::var("MAMBA_ROOT_PREFIX") {
        return PathBuf::from(prefix);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(home).join(".ruleflow").join("micromamba")
});

/// Resolves the frontend binary, preferring an explicit configuration.
pub fn resolve_frontend(configured: Option<&Path>) -> Option<PathBuf> {
    match configured {
        Some(path) => locate_binary(&path.to_string_lossy()),
        None => (*MICROMAMBA_PATH).clone(),
    }
}

/// Creates a Command configured with the correct MAMBA_ROOT_PREFIX.
fn micromamba_command(frontend: &Path) -> Command {
    let mut cmd = Command::new(frontend);
    cmd.env("MAMBA_ROOT_PREFIX", &*MAMBA_ROOT_PREFIX);
    cmd
}

/// Extracts environment names from `micromamba env list` output.
///
/// Environments listed only by path are named after their last component.
pub fn parse_env_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let first = line.split_whitespace().next()?;
            if first.starts_with('/') {
                Path::new(first)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            } else if first.chars().all(|c| c.is_alphanumeric() || "-_.".contains(c)) {
                Some(first.to_string())
            } else {
                None
            }
        })
        .filter(|name| name != "Name")
        .collect()
}

/// Checks whether a micromamba environment exists.
pub fn check_env(frontend: &Path, env_name: &str) -> Result<bool> {
    let output = micromamba_command(frontend)
        .arg("env")
        .arg("list")
        .output()
        .map_err(|e| EngineError::Environment {
            rule: env_name.to_string(),
            reason: format!("failed to run {}: {}", frontend.display(), e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::Environment {
            rule: env_name.to_string(),
            reason: format!("failed to list environments: {}", stderr.trim()),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let exists = parse_env_list(&stdout).iter().any(|name| name == env_name);
    debug!("Environment '{}' present: {}", env_name, exists);
    Ok(exists)
}

/// Builds the command running `script` inside `env_name`.
pub fn run_command(frontend: &Path, env_name: &str, script: &Path) -> Command {
    let mut cmd = micromamba_command(frontend);
    cmd.arg("run").arg("-n").arg(env_name).arg("bash").arg(script);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_list() {
        let stdout = "\
  Name        Active  Path
──────────────────────────────────────
  base                /opt/micromamba
  proteomics  *       /opt/micromamba/envs/proteomics
  comet-2024          /opt/micromamba/envs/comet-2024
";
        let names = parse_env_list(stdout);
        assert_eq!(names, vec!["base", "proteomics", "comet-2024"]);
    }

    #[test]
    fn test_parse_env_list_conda_style() {
        let stdout = "\
# conda environments:
#
base                  *  /home/user/miniconda3
search                   /home/user/miniconda3/envs/search
/scratch/envs/scoring
";
        let names = parse_env_list(stdout);
        assert_eq!(names, vec!["base", "search", "scoring"]);
    }

    #[test]
    fn test_parse_env_list_empty() {
        assert!(parse_env_list("").is_empty());
    }

    #[test]
    fn test_run_command_arguments() {
        let cmd = run_command(Path::new("/opt/micromamba"), "proteomics", Path::new("/tmp/job.sh"));
        assert_eq!(cmd.get_program(), "/opt/micromamba");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["run", "-n", "proteomics", "bash", "/tmp/job.sh"]);
        assert!(cmd
            .get_envs()
            .any(|(k, _)| k == "MAMBA_ROOT_PREFIX"));
    }

    #[test]
    fn test_check_env_with_missing_frontend() {
        let err = check_env(Path::new("/nonexistent/micromamba"), "proteomics").unwrap_err();
        assert!(matches!(err, EngineError::Environment { .. }));
    }

    #[test]
    fn test_resolve_configured_frontend_missing() {
        assert!(resolve_frontend(Some(Path::new("/nonexistent/micromamba"))).is_none());
    }
}
