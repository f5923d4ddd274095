//! Job Graph Construction
//!
//! Builds the job DAG for a set of requested targets by recursively
//! resolving each path to the rule producing it:
//! - a path produced by a rule becomes a job, shared by everything needing it
//! - an unproducible path that exists on disk is a leaf
//! - an unproducible path that does not exist is a missing input
//!
//! Building has no side effects beyond recording file metadata in the
//! snapshot the scheduler later decides staleness from.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::error::{EngineError, Result};
use crate::workflow::model::{BoundRule, CompiledRule, NamedPaths};
use crate::workflow::registry::RuleRegistry;
use crate::workflow::snapshot::FileSnapshot;
use crate::workflow::wildcards::{describe, Wildcards};

/// Index of a job inside its [`Dag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub usize);

/// A rule instance bound to one wildcard binding.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub bound: BoundRule,
    /// Command rendered against the final output paths, with the declared
    /// threads; the runner re-renders it with the threads actually granted
    pub command: String,
    /// Jobs producing this job's inputs
    pub dependencies: Vec<JobId>,
}

impl Job {
    pub fn rule_name(&self) -> &str {
        self.bound.rule.name()
    }

    /// Human readable identity, e.g. `search[dataset=d1,db=human]`.
    pub fn label(&self) -> String {
        job_label(self.rule_name(), &self.bound.wildcards)
    }

    pub fn inputs(&self) -> &NamedPaths {
        &self.bound.inputs
    }

    pub fn outputs(&self) -> &NamedPaths {
        &self.bound.outputs
    }

    pub fn log(&self) -> Option<&Path> {
        self.bound.log.as_deref()
    }

    /// Scheduling weight (the rule's thread count).
    pub fn threads(&self) -> usize {
        self.bound.rule.rule().threads
    }
}

fn job_label(rule: &str, wildcards: &Wildcards) -> String {
    if wildcards.is_empty() {
        rule.to_string()
    } else {
        format!("{}[{}]", rule, describe(wildcards))
    }
}

/// The immutable job graph of one invocation.
#[derive(Debug, Clone)]
pub struct Dag {
    jobs: Vec<Job>,
    dependents: Vec<Vec<JobId>>,
    targets: Vec<PathBuf>,
    leaves: Vec<PathBuf>,
    snapshot: FileSnapshot,
}

impl Dag {
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id.0]
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn dependencies(&self, id: JobId) -> &[JobId] {
        &self.jobs[id.0].dependencies
    }

    pub fn dependents(&self, id: JobId) -> &[JobId] {
        &self.dependents[id.0]
    }

    /// Requested target paths, after expansion.
    pub fn targets(&self) -> &[PathBuf] {
        &self.targets
    }

    /// Pre-existing input paths no rule produces.
    pub fn leaves(&self) -> &[PathBuf] {
        &self.leaves
    }

    pub fn snapshot(&self) -> &FileSnapshot {
        &self.snapshot
    }

    /// Number of jobs per rule.
    pub fn job_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for job in &self.jobs {
            *counts.entry(job.rule_name().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Every job transitively depending on `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: JobId) -> Vec<JobId> {
        let mut seen = vec![false; self.jobs.len()];
        let mut queue: VecDeque<JobId> = self.dependents(id).iter().copied().collect();
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if seen[next.0] {
                continue;
            }
            seen[next.0] = true;
            out.push(next);
            queue.extend(self.dependents(next).iter().copied());
        }
        out.sort();
        out
    }

    /// Orders jobs so dependencies come first, using Kahn's algorithm.
    pub fn topological_order(&self) -> Result<Vec<JobId>> {
        let mut in_degree: Vec<usize> = self.jobs.iter().map(|j| j.dependencies.len()).collect();

        let mut queue: VecDeque<JobId> = self
            .jobs
            .iter()
            .filter(|j| j.dependencies.is_empty())
            .map(|j| j.id)
            .collect();

        let mut sorted = Vec::with_capacity(self.jobs.len());
        while let Some(current) = queue.pop_front() {
            sorted.push(current);
            for &successor in self.dependents(current) {
                in_degree[successor.0] -= 1;
                if in_degree[successor.0] == 0 {
                    queue.push_back(successor);
                }
            }
        }

        if sorted.len() != self.jobs.len() {
            let chain = self
                .jobs
                .iter()
                .filter(|j| in_degree[j.id.0] > 0)
                .map(|j| j.label())
                .collect();
            return Err(EngineError::Cycle { chain });
        }

        Ok(sorted)
    }

    /// Graphviz rendering of the job graph.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph ruleflow {\n    node [shape=box, style=rounded];\n");
        for job in &self.jobs {
            let _ = writeln!(
                out,
                "    {} [label=\"{}\"];",
                job.id.0,
                job.label().replace('"', "\\\"")
            );
        }
        for job in &self.jobs {
            for dep in &job.dependencies {
                let _ = writeln!(out, "    {} -> {};", dep.0, job.id.0);
            }
        }
        out.push_str("}\n");
        out
    }
}

type JobKey = (String, Wildcards);

/// Recursive resolver turning target paths into a [`Dag`].
pub struct DagBuilder<'a> {
    registry: &'a RuleRegistry,
    snapshot: FileSnapshot,
    jobs: Vec<Job>,
    index: HashMap<JobKey, JobId>,
    stack: Vec<JobKey>,
    leaves: Vec<PathBuf>,
}

impl<'a> DagBuilder<'a> {
    pub fn new(registry: &'a RuleRegistry, snapshot: FileSnapshot) -> Self {
        Self {
            registry,
            snapshot,
            jobs: Vec::new(),
            index: HashMap::new(),
            stack: Vec::new(),
            leaves: Vec::new(),
        }
    }

    /// Builds the graph for `targets`.
    ///
    /// Fails before anything runs on pattern ambiguity, cycles or missing
    /// leaf inputs.
    pub fn build<S: AsRef<str>>(mut self, targets: &[S]) -> Result<Dag> {
        let mut target_paths = Vec::with_capacity(targets.len());
        for target in targets {
            let path = normalize(target.as_ref());
            if !target_paths.contains(&path) {
                target_paths.push(path);
            }
        }

        info!("Building job graph for {} targets", target_paths.len());

        for target in &target_paths {
            self.resolve_path(target, None)?;
        }

        let mut dependents = vec![Vec::new(); self.jobs.len()];
        for job in &self.jobs {
            for dep in &job.dependencies {
                dependents[dep.0].push(job.id);
            }
        }

        let dag = Dag {
            jobs: self.jobs,
            dependents,
            targets: target_paths.into_iter().map(PathBuf::from).collect(),
            leaves: self.leaves,
            snapshot: self.snapshot,
        };

        info!(
            "Job graph ready: {} jobs ({})",
            dag.len(),
            dag.job_counts()
                .iter()
                .map(|(rule, n)| format!("{} x{}", rule, n))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(dag)
    }

    fn resolve_path(&mut self, path: &str, required_by: Option<&str>) -> Result<Option<JobId>> {
        let Some((rule, wildcards)) = self.registry.resolve(path)? else {
            let as_path = PathBuf::from(path);
            if self.snapshot.observe(&as_path).is_some() {
                if !self.leaves.contains(&as_path) {
                    self.leaves.push(as_path);
                }
                return Ok(None);
            }
            return Err(EngineError::MissingInput {
                path: as_path,
                required_by: required_by.map(str::to_string),
            });
        };

        let key: JobKey = (rule.name().to_string(), wildcards);

        if let Some(pos) = self.stack.iter().position(|k| *k == key) {
            let mut chain: Vec<String> = self.stack[pos..]
                .iter()
                .map(|(r, wc)| job_label(r, wc))
                .collect();
            chain.push(job_label(&key.0, &key.1));
            return Err(EngineError::Cycle { chain });
        }

        if let Some(&id) = self.index.get(&key) {
            return Ok(Some(id));
        }

        self.stack.push(key.clone());
        let result = self.build_job(&rule, &key.1);
        self.stack.pop();

        let job = result?;
        let id = job.id;
        self.index.insert(key, id);
        self.jobs.push(job);
        Ok(Some(id))
    }

    fn build_job(&mut self, rule: &Arc<CompiledRule>, wildcards: &Wildcards) -> Result<Job> {
        let bound = rule.bind(wildcards, &self.registry.config().enumerations)?;
        let command = bound.render_command(&bound.outputs, rule.rule().threads)?;

        let mut dependencies = Vec::new();
        let inputs: Vec<String> = bound
            .inputs
            .paths()
            .map(|p| normalize(&p.to_string_lossy()))
            .collect();
        for input in inputs {
            if let Some(dep) = self.resolve_path(&input, Some(rule.name()))? {
                if !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }
        }

        self.snapshot.observe_job(&bound);

        let id = JobId(self.jobs.len());
        debug!(
            "Job {} = {} ({} dependencies)",
            id.0,
            job_label(rule.name(), wildcards),
            dependencies.len()
        );

        Ok(Job {
            id,
            bound,
            command,
            dependencies,
        })
    }
}

/// Strips redundant `./` prefixes so equal paths resolve to one job.
fn normalize(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::config::PipelineConfig;
    use crate::workflow::model::Rule;
    use std::time::{Duration, SystemTime};

    fn config() -> Arc<PipelineConfig> {
        Arc::new(
            PipelineConfig::new()
                .with_enumeration("db", ["human", "yeast"])
                .with_enumeration("dataset", ["d1", "d2"]),
        )
    }

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + secs)
    }

    fn chain_registry() -> RuleRegistry {
        let mut registry = RuleRegistry::new(config());
        registry
            .register_all([
                Rule::new("index", "build {input} {output}")
                    .with_input("fasta", "databases/{db}.fasta")
                    .with_directory_output("dir", "index/{db}", &["{db}.idx"]),
                Rule::new("search", "search {input.index} {input.spectra} > {output}")
                    .with_input("spectra", "raw/{dataset}.mzML")
                    .with_input("index", "index/{db}")
                    .with_output("pin", "search/{db}/{dataset}.pin"),
            ])
            .unwrap();
        registry
    }

    fn leaves() -> FileSnapshot {
        let mut snap = FileSnapshot::fixture();
        for db in ["human", "yeast"] {
            snap.insert(format!("databases/{}.fasta", db), t(0), false);
        }
        for ds in ["d1", "d2"] {
            snap.insert(format!("raw/{}.mzML", ds), t(0), false);
        }
        snap
    }

    #[test]
    fn test_build_shares_jobs() {
        let registry = chain_registry();
        let targets = registry.expand("search/{db}/{dataset}.pin").unwrap();
        let dag = DagBuilder::new(&registry, leaves()).build(&targets).unwrap();

        let counts = dag.job_counts();
        assert_eq!(counts["index"], 2);
        assert_eq!(counts["search"], 4);
        assert_eq!(dag.len(), 6);
        assert_eq!(dag.leaves().len(), 4);
        assert_eq!(dag.targets().len(), 4);
    }

    #[test]
    fn test_dependencies_come_first() {
        let registry = chain_registry();
        let dag = DagBuilder::new(&registry, leaves())
            .build(&["search/human/d1.pin"])
            .unwrap();

        assert_eq!(dag.len(), 2);
        let search = dag.jobs().iter().find(|j| j.rule_name() == "search").unwrap();
        assert_eq!(search.dependencies.len(), 1);
        let index = dag.job(search.dependencies[0]);
        assert_eq!(index.rule_name(), "index");
        assert_eq!(dag.dependents(index.id), &[search.id]);

        let order = dag.topological_order().unwrap();
        assert_eq!(order, vec![index.id, search.id]);
    }

    #[test]
    fn test_missing_leaf_input() {
        let registry = chain_registry();
        let err = DagBuilder::new(&registry, FileSnapshot::fixture())
            .build(&["search/human/d1.pin"])
            .unwrap_err();
        match err {
            EngineError::MissingInput { path, required_by } => {
                assert_eq!(path, PathBuf::from("raw/d1.mzML"));
                assert_eq!(required_by.as_deref(), Some("search"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_target_without_rule() {
        let registry = chain_registry();
        let err = DagBuilder::new(&registry, leaves())
            .build(&["nowhere/file.txt"])
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingInput { required_by: None, .. }));
    }

    #[test]
    fn test_existing_target_without_rule_is_leaf() {
        let registry = chain_registry();
        let dag = DagBuilder::new(&registry, leaves())
            .build(&["raw/d1.mzML"])
            .unwrap();
        assert!(dag.is_empty());
        assert_eq!(dag.leaves(), &[PathBuf::from("raw/d1.mzML")]);
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut registry = RuleRegistry::new(config());
        registry
            .register_all([
                Rule::new("a", "cp {input} {output}")
                    .with_input("src", "b/{x}.txt")
                    .with_output("dst", "a/{x}.txt"),
                Rule::new("b", "cp {input} {output}")
                    .with_input("src", "a/{x}.txt")
                    .with_output("dst", "b/{x}.txt"),
            ])
            .unwrap();

        let err = DagBuilder::new(&registry, FileSnapshot::fixture())
            .build(&["a/1.txt"])
            .unwrap_err();
        match err {
            EngineError::Cycle { chain } => {
                assert_eq!(chain, vec!["a[x=1]", "b[x=1]", "a[x=1]"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_cycle_even_when_files_exist() {
        let mut registry = RuleRegistry::new(config());
        registry
            .register(
                Rule::new("loop", "true")
                    .with_input("prev", "loop/{x}.txt")
                    .with_output("next", "loop/{x}.txt"),
            )
            .unwrap();
        let mut snap = FileSnapshot::fixture();
        snap.insert("loop/1.txt", t(0), false);
        assert!(matches!(
            DagBuilder::new(&registry, snap).build(&["loop/1.txt"]),
            Err(EngineError::Cycle { .. })
        ));
    }

    #[test]
    fn test_duplicate_targets_and_dot_prefix() {
        let registry = chain_registry();
        let dag = DagBuilder::new(&registry, leaves())
            .build(&["search/human/d1.pin", "./search/human/d1.pin"])
            .unwrap();
        assert_eq!(dag.targets().len(), 1);
        assert_eq!(dag.len(), 2);
    }

    #[test]
    fn test_transitive_dependents() {
        let registry = chain_registry();
        let targets = registry.expand("search/{db}/{dataset}.pin").unwrap();
        let dag = DagBuilder::new(&registry, leaves()).build(&targets).unwrap();

        let human_index = dag
            .jobs()
            .iter()
            .find(|j| j.rule_name() == "index" && j.bound.wildcards["db"] == "human")
            .unwrap();
        let dependents = dag.transitive_dependents(human_index.id);
        assert_eq!(dependents.len(), 2);
        assert!(dependents
            .iter()
            .all(|id| dag.job(*id).bound.wildcards["db"] == "human"));
    }

    #[test]
    fn test_to_dot() {
        let registry = chain_registry();
        let dag = DagBuilder::new(&registry, leaves())
            .build(&["search/human/d1.pin"])
            .unwrap();
        let dot = dag.to_dot();
        assert!(dot.starts_with("digraph ruleflow"));
        assert!(dot.contains("index[db=human]"));
        assert!(dot.contains("0 -> 1;"));
    }

    #[test]
    fn test_job_label_and_command() {
        let registry = chain_registry();
        let dag = DagBuilder::new(&registry, leaves())
            .build(&["search/yeast/d2.pin"])
            .unwrap();
        let search = dag.job(JobId(1));
        assert_eq!(search.label(), "search[dataset=d2,db=yeast]");
        assert_eq!(search.command, "search index/yeast raw/d2.mzML > search/yeast/d2.pin");
        assert_eq!(search.threads(), 1);
    }
}
