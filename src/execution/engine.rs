//! Job Scheduler
//!
//! The engine that drives a [`Dag`] to completion:
//! - Weighted parallel dispatch to a fixed worker pool
//! - Staleness decisions from the build-time filesystem snapshot
//! - Failure propagation to transitive dependents
//! - Run-level abort through an [`AbortHandle`]
//!
//! The scheduling thread is the only owner of the job-state table. Workers
//! receive job ids over a channel and report results back over another, so
//! every state transition is serialized and each job is claimed once.

use std::path::PathBuf;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::{Dag, JobId, Staleness};

use super::backend::{AbortHandle, JobExecutor};

/// Interval for checking the abort flag while jobs are running.
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Why a job finished without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpToDate,
    DependencyFailed,
    /// Left undispatched when the run was aborted.
    Cancelled,
}

/// Lifecycle of one job within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum JobState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped(_)
        )
    }

    /// Whether dependents may proceed past this job.
    fn satisfies_dependents(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Skipped(SkipReason::UpToDate)
        )
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    #[serde(skip)]
    pub id: JobId,
    pub label: String,
    pub rule: String,
    #[serde(flatten)]
    pub state: JobState,
    /// Why the job ran, or the error it failed with
    pub detail: Option<String>,
    pub log: Option<PathBuf>,
    pub duration_ms: Option<u128>,
}

/// Everything a run produced, in topological order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub jobs: Vec<JobReport>,
    pub timeline: ExecutionTimeline,
    pub dry_run: bool,
    pub aborted: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn with_state(&self, state: JobState) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(move |j| j.state == state)
    }

    pub fn succeeded(&self) -> usize {
        self.with_state(JobState::Succeeded).count()
    }

    pub fn failed(&self) -> usize {
        self.with_state(JobState::Failed).count()
    }

    pub fn up_to_date(&self) -> usize {
        self.with_state(JobState::Skipped(SkipReason::UpToDate)).count()
    }

    pub fn dependency_failed(&self) -> usize {
        self.with_state(JobState::Skipped(SkipReason::DependencyFailed))
            .count()
    }

    pub fn cancelled(&self) -> usize {
        self.with_state(JobState::Skipped(SkipReason::Cancelled)).count()
    }

    /// Jobs a dry run found stale.
    pub fn would_run(&self) -> impl Iterator<Item = &JobReport> {
        let dry_run = self.dry_run;
        self.jobs
            .iter()
            .filter(move |j| dry_run && j.state == JobState::Ready)
    }

    /// True when no job failed, was skipped because of a failure, or was cancelled.
    pub fn is_success(&self) -> bool {
        !self.aborted
            && self.failed() == 0
            && self.dependency_failed() == 0
            && self.cancelled() == 0
    }
}

/// Job scheduler.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ruleflow::environment::IsolationSettings;
/// use ruleflow::execution::{Engine, JobRunner};
/// use ruleflow::workflow::{DagBuilder, FileSnapshot, PipelineConfig, RuleRegistry};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = RuleRegistry::new(Arc::new(PipelineConfig::new()));
///     let dag = DagBuilder::new(&registry, FileSnapshot::live()).build(&["out.txt"])?;
///
///     let runner = JobRunner::new(".", IsolationSettings::default());
///     let mut engine = Engine::new(dag, Arc::new(runner));
///     engine.set_max_weight(4);
///
///     let report = engine.run()?;
///     assert!(report.is_success());
///     Ok(())
/// }
/// ```
pub struct Engine {
    dag: Arc<Dag>,
    executor: Arc<dyn JobExecutor>,
    max_weight: usize,
    force_all: bool,
    dry_run: bool,
    abort: AbortHandle,
}

impl Engine {
    /// Creates an engine with a budget of one weight unit per CPU.
    pub fn new(dag: Dag, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            dag: Arc::new(dag),
            executor,
            max_weight: num_cpus::get(),
            force_all: false,
            dry_run: false,
            abort: AbortHandle::new(),
        }
    }

    /// Sets the total weight of concurrently running jobs.
    pub fn set_max_weight(&mut self, max: usize) {
        self.max_weight = max.max(1);
    }

    /// Treats every job as stale.
    pub fn set_force_all(&mut self, force: bool) {
        self.force_all = force;
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Shares an externally owned abort flag (e.g. a Ctrl-C handler's).
    pub fn set_abort_handle(&mut self, abort: AbortHandle) {
        self.abort = abort;
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Scheduling weight of a job, clamped to the budget.
    fn weight(&self, id: JobId) -> usize {
        self.dag.job(id).threads().clamp(1, self.max_weight)
    }

    fn staleness(&self, id: JobId, ran: &[bool]) -> Staleness {
        if self.force_all {
            return Staleness::Forced;
        }
        if self.dag.dependencies(id).iter().any(|d| ran[d.0]) {
            return Staleness::UpstreamRan;
        }
        self.dag.snapshot().staleness(&self.dag.job(id).bound)
    }

    /// Executes the graph.
    ///
    /// Job failures are reported in the [`RunReport`]; an `Err` means the
    /// scheduler itself could not proceed.
    pub fn run(&self) -> Result<RunReport> {
        let order = self.dag.topological_order()?;
        let start = Instant::now();

        info!(
            "Starting execution ({} jobs, max weight: {}, dry run: {}, force: {})",
            self.dag.len(),
            self.max_weight,
            self.dry_run,
            self.force_all
        );

        let mut table = StateTable::new(self.dag.len());
        let mut timeline = ExecutionTimeline::new();

        if self.dry_run {
            self.plan(&order, &mut table, &mut timeline);
        } else {
            self.execute(&order, &mut table, &mut timeline)?;
        }

        let durations = timeline.get_durations();
        let jobs = order
            .iter()
            .map(|&id| {
                let job = self.dag.job(id);
                let label = job.label();
                JobReport {
                    id,
                    duration_ms: durations.get(&label).copied(),
                    label,
                    rule: job.rule_name().to_string(),
                    state: table.states[id.0],
                    detail: table.details[id.0].clone(),
                    log: job.log().map(PathBuf::from),
                }
            })
            .collect();

        Ok(RunReport {
            jobs,
            timeline,
            dry_run: self.dry_run,
            aborted: table.aborted,
            elapsed: start.elapsed(),
        })
    }

    /// Computes the would-run set without dispatching anything.
    fn plan(&self, order: &[JobId], table: &mut StateTable, timeline: &mut ExecutionTimeline) {
        for &id in order {
            let staleness = self.staleness(id, &table.ran);
            let label = self.dag.job(id).label();
            if staleness.is_stale() {
                info!("[DRY RUN] would run {} ({})", label, staleness);
                table.states[id.0] = JobState::Ready;
                table.details[id.0] = Some(staleness.to_string());
                table.ran[id.0] = true;
            } else {
                debug!("[DRY RUN] {} is up to date", label);
                table.states[id.0] = JobState::Skipped(SkipReason::UpToDate);
                timeline.add_event(label, EventType::Skipped);
            }
        }
    }

    fn execute(
        &self,
        order: &[JobId],
        table: &mut StateTable,
        timeline: &mut ExecutionTimeline,
    ) -> Result<()> {
        let pool_size = self.max_weight.min(self.dag.len()).max(1);
        let (job_tx, job_rx) = channel::<(JobId, usize)>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, done_rx) = channel::<(JobId, Result<()>)>();

        let mut workers = Vec::with_capacity(pool_size);
        for worker in 0..pool_size {
            let rx = Arc::clone(&job_rx);
            let done = done_tx.clone();
            let dag = Arc::clone(&self.dag);
            let executor = Arc::clone(&self.executor);
            let abort = self.abort.clone();

            let handle = thread::Builder::new()
                .name(format!("ruleflow-worker-{}", worker))
                .spawn(move || loop {
                    let next = match rx.lock() {
                        Ok(guard) => guard.recv(),
                        Err(_) => break,
                    };
                    let Ok((id, threads)) = next else { break };

                    let result = executor.execute(dag.job(id), threads, &abort);
                    if done.send((id, result)).is_err() {
                        break;
                    }
                })?;
            workers.push(handle);
        }
        drop(done_tx);

        let total = self.dag.len();
        let mut running = 0usize;
        let mut running_weight = 0usize;

        loop {
            if !table.aborted && self.abort.is_aborted() {
                table.aborted = true;
                let cancelled = table.cancel_remaining();
                warn!(
                    "Run aborted: {} jobs cancelled, waiting for {} running jobs",
                    cancelled, running
                );
            }

            if !table.aborted {
                for &id in order {
                    if table.states[id.0] == JobState::Pending
                        && self
                            .dag
                            .dependencies(id)
                            .iter()
                            .all(|d| table.states[d.0].satisfies_dependents())
                    {
                        let staleness = self.staleness(id, &table.ran);
                        let label = self.dag.job(id).label();
                        if staleness.is_stale() {
                            debug!("Job {} is ready ({})", label, staleness);
                            table.states[id.0] = JobState::Ready;
                            table.details[id.0] = Some(staleness.to_string());
                        } else {
                            debug!("Job {} is up to date", label);
                            table.states[id.0] = JobState::Skipped(SkipReason::UpToDate);
                            timeline.add_event(label, EventType::Skipped);
                            continue;
                        }
                    }

                    if table.states[id.0] == JobState::Ready {
                        let weight = self.weight(id);
                        if running_weight + weight > self.max_weight {
                            continue;
                        }
                        let label = self.dag.job(id).label();
                        job_tx.send((id, weight)).map_err(|_| {
                            EngineError::Interrupted("worker pool terminated".to_string())
                        })?;
                        table.states[id.0] = JobState::Running;
                        running += 1;
                        running_weight += weight;
                        table.started += 1;
                        info!(
                            "[{}/{}] Starting {} (weight {})",
                            table.started, total, label, weight
                        );
                        timeline.add_event(label, EventType::Started);
                    }
                }
            }

            if running == 0 {
                break;
            }

            let (id, result) = match done_rx.recv_timeout(ABORT_CHECK_INTERVAL) {
                Ok(done) => done,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Interrupted(
                        "worker pool terminated".to_string(),
                    ))
                }
            };

            running -= 1;
            running_weight -= self.weight(id);
            let label = self.dag.job(id).label();

            match result {
                Ok(()) => {
                    info!("Job {} completed successfully", label);
                    table.states[id.0] = JobState::Succeeded;
                    table.ran[id.0] = true;
                    timeline.add_event(label, EventType::Completed);
                }
                Err(e) => {
                    error!("Job {} failed: {}", label, e);
                    table.states[id.0] = JobState::Failed;
                    table.details[id.0] = Some(e.to_string());
                    timeline.add_event(label.clone(), EventType::Failed);

                    for dependent in self.dag.transitive_dependents(id) {
                        if matches!(
                            table.states[dependent.0],
                            JobState::Pending | JobState::Ready
                        ) {
                            table.states[dependent.0] =
                                JobState::Skipped(SkipReason::DependencyFailed);
                            table.details[dependent.0] = Some(format!("{} failed", label));
                        }
                    }
                }
            }
        }

        drop(job_tx);
        for handle in workers {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        // Anything still pending could never become ready.
        table.cancel_remaining();
        Ok(())
    }
}

/// Scheduler-owned per-job bookkeeping.
struct StateTable {
    states: Vec<JobState>,
    details: Vec<Option<String>>,
    /// Jobs executed (or, in a dry run, planned) during this run
    ran: Vec<bool>,
    started: usize,
    aborted: bool,
}

impl StateTable {
    fn new(len: usize) -> Self {
        Self {
            states: vec![JobState::Pending; len],
            details: vec![None; len],
            ran: vec![false; len],
            started: 0,
            aborted: false,
        }
    }

    fn cancel_remaining(&mut self) -> usize {
        let mut cancelled = 0;
        for (state, detail) in self.states.iter_mut().zip(self.details.iter_mut()) {
            if matches!(state, JobState::Pending | JobState::Ready) {
                *state = JobState::Skipped(SkipReason::Cancelled);
                *detail = Some("run aborted".to_string());
                cancelled += 1;
            }
        }
        cancelled
    }
}
