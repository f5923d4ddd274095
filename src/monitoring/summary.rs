//! Run Summary
//!
//! Human-readable and machine-readable reports of a finished run.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::execution::{JobReport, JobState, RunReport, SkipReason};

/// Serializable form of a [`RunReport`].
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub dry_run: bool,
    pub aborted: bool,
    pub elapsed_ms: u128,
    pub succeeded: usize,
    pub failed: usize,
    pub up_to_date: usize,
    pub dependency_failed: usize,
    pub cancelled: usize,
    pub jobs: &'a [JobReport],
}

impl<'a> RunSummary<'a> {
    pub fn new(report: &'a RunReport) -> Self {
        Self {
            finished_at: Utc::now(),
            success: report.is_success(),
            dry_run: report.dry_run,
            aborted: report.aborted,
            elapsed_ms: report.elapsed.as_millis(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            up_to_date: report.up_to_date(),
            dependency_failed: report.dependency_failed(),
            cancelled: report.cancelled(),
            jobs: &report.jobs,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize run summary: {}", e)))
    }

    /// Writes the summary as pretty-printed JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Renders the terminal summary of a run.
pub fn render(report: &RunReport) -> String {
    let mut lines = Vec::new();

    if report.dry_run {
        let planned: Vec<&JobReport> = report.would_run().collect();
        lines.push(format!(
            "{} {} of {} jobs would run",
            "DRY RUN".cyan().bold(),
            planned.len(),
            report.jobs.len()
        ));
        for job in planned {
            lines.push(format!(
                "  {} {} ({})",
                "would run".cyan(),
                job.label,
                job.detail.as_deref().unwrap_or("stale")
            ));
        }
        return lines.join("\n");
    }

    for job in &report.jobs {
        let line = match job.state {
            JobState::Succeeded => format!(
                "  {} {}{}",
                "done".green(),
                job.label,
                job.duration_ms
                    .map(|ms| format!(" ({} ms)", ms))
                    .unwrap_or_default()
            ),
            JobState::Skipped(SkipReason::UpToDate) => {
                format!("  {} {}", "up to date".dimmed(), job.label)
            }
            JobState::Failed => format!(
                "  {} {}: {}{}",
                "FAILED".red().bold(),
                job.label,
                job.detail.as_deref().unwrap_or("unknown error"),
                job.log
                    .as_ref()
                    .map(|l| format!(" [log: {}]", l.display()))
                    .unwrap_or_default()
            ),
            JobState::Skipped(SkipReason::DependencyFailed) => format!(
                "  {} {} ({})",
                "skipped".yellow(),
                job.label,
                job.detail.as_deref().unwrap_or("dependency failed")
            ),
            JobState::Skipped(SkipReason::Cancelled) => {
                format!("  {} {}", "cancelled".yellow(), job.label)
            }
            JobState::Pending | JobState::Ready | JobState::Running => {
                format!("  {} {}", "not run".yellow(), job.label)
            }
        };
        lines.push(line);
    }

    let status = if report.is_success() {
        "Run completed successfully".green().bold()
    } else if report.aborted {
        "Run aborted".red().bold()
    } else {
        "Run failed".red().bold()
    };

    lines.push(String::new());
    lines.push(format!(
        "{}: {} succeeded, {} up to date, {} failed, {} skipped, {} cancelled in {:.2?}",
        status,
        report.succeeded(),
        report.up_to_date(),
        report.failed(),
        report.dependency_failed(),
        report.cancelled(),
        report.elapsed
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::ExecutionTimeline;
    use crate::workflow::JobId;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn job(id: usize, label: &str, state: JobState, detail: Option<&str>) -> JobReport {
        JobReport {
            id: JobId(id),
            label: label.to_string(),
            rule: label.split('[').next().unwrap_or(label).to_string(),
            state,
            detail: detail.map(str::to_string),
            log: Some(PathBuf::from(format!("logs/{}.log", id))),
            duration_ms: None,
        }
    }

    fn report(dry_run: bool) -> RunReport {
        RunReport {
            jobs: vec![
                job(0, "convert[s=a]", JobState::Succeeded, Some("missing output conv/a.txt")),
                job(
                    1,
                    "convert[s=b]",
                    JobState::Failed,
                    Some("Rule 'convert[s=b]' failed with exit code 2"),
                ),
                job(
                    2,
                    "score[s=b]",
                    JobState::Skipped(SkipReason::DependencyFailed),
                    Some("convert[s=b] failed"),
                ),
                job(3, "index[db=human]", JobState::Skipped(SkipReason::UpToDate), None),
            ],
            timeline: ExecutionTimeline::new(),
            dry_run,
            aborted: false,
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_render_lists_failures_with_logs() {
        colored::control::set_override(false);
        let text = render(&report(false));
        assert!(text.contains("FAILED convert[s=b]"));
        assert!(text.contains("[log: logs/1.log]"));
        assert!(text.contains("skipped score[s=b]"));
        assert!(text.contains("Run failed"));
        assert!(text.contains("1 succeeded, 1 up to date, 1 failed, 1 skipped, 0 cancelled"));
    }

    #[test]
    fn test_render_dry_run() {
        colored::control::set_override(false);
        let mut dry = report(true);
        dry.jobs[0].state = JobState::Ready;
        let text = render(&dry);
        assert!(text.contains("1 of 4 jobs would run"));
        assert!(text.contains("would run convert[s=a] (missing output conv/a.txt)"));
    }

    #[test]
    fn test_summary_json() {
        let report = report(false);
        let summary = RunSummary::new(&report);
        assert!(!summary.success);
        assert_eq!(summary.failed, 1);

        let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["jobs"].as_array().unwrap().len(), 4);
        assert_eq!(json["jobs"][1]["state"], "failed");
        assert_eq!(json["jobs"][2]["reason"], "dependency_failed");
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn test_summary_write_creates_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let report = report(false);
        RunSummary::new(&report).write(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("\"success\": false"));
    }
}
