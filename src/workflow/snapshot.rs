//! Filesystem Snapshot
//!
//! Existence and modification times are recorded while the graph is built and
//! never re-queried during execution. Staleness of a job is decided purely
//! from this snapshot.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::trace;

use crate::workflow::model::BoundRule;

/// What the snapshot knows about one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// Why a job has to run, or that it does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    UpToDate,
    MissingOutput(PathBuf),
    /// A directory output exists but one of its markers does not.
    IncompleteDirectory(PathBuf),
    NewerInput { input: PathBuf, output: PathBuf },
    RuleChanged(PathBuf),
    /// Forced by the caller.
    Forced,
    /// A dependency was executed during this run.
    UpstreamRan,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::UpToDate)
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::UpToDate => write!(f, "up to date"),
            Staleness::MissingOutput(path) => write!(f, "missing output {}", path.display()),
            Staleness::IncompleteDirectory(path) => {
                write!(f, "incomplete directory {}", path.display())
            }
            Staleness::NewerInput { input, output } => write!(
                f,
                "input {} is not older than {}",
                input.display(),
                output.display()
            ),
            Staleness::RuleChanged(path) => {
                write!(f, "rule changed after {} was written", path.display())
            }
            Staleness::Forced => write!(f, "forced"),
            Staleness::UpstreamRan => write!(f, "upstream job ran"),
        }
    }
}

/// A point-in-time record of the paths the engine looked at.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    entries: HashMap<PathBuf, Option<FileStat>>,
    live: bool,
    /// Directory relative paths are statted against; the CWD when unset.
    root: Option<PathBuf>,
}

impl FileSnapshot {
    /// A snapshot that stats the real filesystem the first time a path is seen.
    pub fn live() -> Self {
        Self {
            entries: HashMap::new(),
            live: true,
            root: None,
        }
    }

    /// A live snapshot resolving relative paths against `root`, the
    /// directory jobs run in.
    pub fn live_in(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::live()
        }
    }

    /// A snapshot that only knows the entries inserted into it.
    pub fn fixture() -> Self {
        Self {
            entries: HashMap::new(),
            live: false,
            root: None,
        }
    }

    /// Records a path as existing with the given modification time.
    pub fn insert(&mut self, path: impl Into<PathBuf>, modified: SystemTime, is_dir: bool) {
        self.entries
            .insert(path.into(), Some(FileStat { modified, is_dir }));
    }

    /// Looks a path up, statting it on first sight for live snapshots.
    pub fn observe(&mut self, path: &Path) -> Option<FileStat> {
        if let Some(entry) = self.entries.get(path) {
            return *entry;
        }
        let stat = if self.live {
            let on_disk = match &self.root {
                Some(root) => root.join(path),
                None => path.to_path_buf(),
            };
            fs::metadata(on_disk).ok().map(|meta| FileStat {
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                is_dir: meta.is_dir(),
            })
        } else {
            None
        };
        trace!("snapshot: {} -> {:?}", path.display(), stat);
        self.entries.insert(path.to_path_buf(), stat);
        stat
    }

    /// Read-only lookup; paths never observed count as missing.
    pub fn get(&self, path: &Path) -> Option<FileStat> {
        self.entries.get(path).copied().flatten()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Records every path staleness checks of `bound` will consult.
    pub fn observe_job(&mut self, bound: &BoundRule) {
        for path in bound.inputs.paths().chain(bound.outputs.paths()) {
            self.observe(path);
        }
        for dir in &bound.directories {
            for marker in &dir.markers {
                self.observe(marker);
            }
        }
    }

    /// Decides from the snapshot whether a job's outputs are current.
    ///
    /// Every output must exist and be strictly newer than every input and
    /// than the rule's declaration. A directory output exists only once all
    /// its markers exist, and its age is that of the oldest marker.
    pub fn staleness(&self, bound: &BoundRule) -> Staleness {
        let mut oldest: Option<(SystemTime, &Path)> = None;

        for path in bound.outputs.paths() {
            let Some(stat) = self.get(path) else {
                return Staleness::MissingOutput(path.to_path_buf());
            };

            let mut age = stat.modified;
            if let Some(dir) = bound.directories.iter().find(|d| d.path == path) {
                if !dir.markers.is_empty() {
                    let mut marker_age: Option<SystemTime> = None;
                    for marker in &dir.markers {
                        match self.get(marker) {
                            Some(m) => {
                                marker_age = Some(match marker_age {
                                    Some(a) => a.min(m.modified),
                                    None => m.modified,
                                })
                            }
                            None => return Staleness::IncompleteDirectory(path.to_path_buf()),
                        }
                    }
                    age = marker_age.unwrap_or(age);
                }
            }

            if oldest.map_or(true, |(t, _)| age < t) {
                oldest = Some((age, path));
            }
        }

        let Some((oldest_time, oldest_path)) = oldest else {
            return Staleness::MissingOutput(PathBuf::new());
        };

        if let Some(declared) = bound.rule.rule().declared_at {
            if declared >= oldest_time {
                return Staleness::RuleChanged(oldest_path.to_path_buf());
            }
        }

        for input in bound.inputs.paths() {
            if let Some(stat) = self.get(input) {
                if stat.modified >= oldest_time {
                    return Staleness::NewerInput {
                        input: input.to_path_buf(),
                        output: oldest_path.to_path_buf(),
                    };
                }
            }
        }

        Staleness::UpToDate
    }
}

impl Default for FileSnapshot {
    fn default() -> Self {
        Self::live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{CompiledRule, Rule};
    use crate::workflow::wildcards::{Enumerations, Wildcards};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + secs)
    }

    fn bind(rule: Rule, pairs: &[(&str, &str)]) -> BoundRule {
        let wc: Wildcards = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let compiled = Arc::new(CompiledRule::compile(rule, &Enumerations::new()).unwrap());
        compiled.bind(&wc, &Enumerations::new()).unwrap()
    }

    fn convert(declared: Option<SystemTime>) -> BoundRule {
        let mut rule = Rule::new("convert", "cp {input} {output}")
            .with_input("raw", "raw/{s}.raw")
            .with_output("mzml", "conv/{s}.mzML");
        rule.declared_at = declared;
        bind(rule, &[("s", "a")])
    }

    #[test]
    fn test_missing_output_is_stale() {
        let mut snap = FileSnapshot::fixture();
        snap.insert("raw/a.raw", t(0), false);
        let bound = convert(None);
        assert_eq!(
            snap.staleness(&bound),
            Staleness::MissingOutput(PathBuf::from("conv/a.mzML"))
        );
    }

    #[test]
    fn test_newer_output_is_up_to_date() {
        let mut snap = FileSnapshot::fixture();
        snap.insert("raw/a.raw", t(0), false);
        snap.insert("conv/a.mzML", t(10), false);
        assert_eq!(snap.staleness(&convert(None)), Staleness::UpToDate);
    }

    #[test]
    fn test_equal_times_are_stale() {
        let mut snap = FileSnapshot::fixture();
        snap.insert("raw/a.raw", t(5), false);
        snap.insert("conv/a.mzML", t(5), false);
        assert!(snap.staleness(&convert(None)).is_stale());
    }

    #[test]
    fn test_newer_input_is_stale() {
        let mut snap = FileSnapshot::fixture();
        snap.insert("raw/a.raw", t(20), false);
        snap.insert("conv/a.mzML", t(10), false);
        assert!(matches!(
            snap.staleness(&convert(None)),
            Staleness::NewerInput { .. }
        ));
    }

    #[test]
    fn test_rule_declared_after_output_is_stale() {
        let mut snap = FileSnapshot::fixture();
        snap.insert("raw/a.raw", t(0), false);
        snap.insert("conv/a.mzML", t(10), false);
        assert!(matches!(
            snap.staleness(&convert(Some(t(30)))),
            Staleness::RuleChanged(_)
        ));
        assert_eq!(snap.staleness(&convert(Some(t(1)))), Staleness::UpToDate);
    }

    #[test]
    fn test_directory_output_needs_all_markers() {
        let rule = Rule::new("index", "build {input} {output}")
            .with_input("fasta", "db/{db}.fasta")
            .with_directory_output("dir", "index/{db}", &["{db}.idx", "meta.json"]);
        let bound = bind(rule, &[("db", "human")]);

        let mut snap = FileSnapshot::fixture();
        snap.insert("db/human.fasta", t(0), false);
        snap.insert("index/human", t(50), true);
        snap.insert("index/human/human.idx", t(40), false);
        assert_eq!(
            snap.staleness(&bound),
            Staleness::IncompleteDirectory(PathBuf::from("index/human"))
        );

        snap.insert("index/human/meta.json", t(45), false);
        assert_eq!(snap.staleness(&bound), Staleness::UpToDate);
    }

    #[test]
    fn test_directory_age_is_oldest_marker() {
        let rule = Rule::new("index", "build {input} {output}")
            .with_input("fasta", "db/{db}.fasta")
            .with_directory_output("dir", "index/{db}", &["a", "b"]);
        let bound = bind(rule, &[("db", "human")]);

        let mut snap = FileSnapshot::fixture();
        snap.insert("db/human.fasta", t(20), false);
        snap.insert("index/human", t(50), true);
        snap.insert("index/human/a", t(10), false);
        snap.insert("index/human/b", t(30), false);
        assert!(matches!(
            snap.staleness(&bound),
            Staleness::NewerInput { .. }
        ));
    }

    #[test]
    fn test_live_snapshot_is_not_requeried() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("late.txt");

        let mut snap = FileSnapshot::live();
        assert!(snap.observe(&file).is_none());

        std::fs::write(&file, "now exists").unwrap();
        assert!(snap.observe(&file).is_none());
        assert!(!snap.exists(&file));
    }

    #[test]
    fn test_live_snapshot_reads_disk() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("present.txt");
        std::fs::write(&file, "x").unwrap();

        let mut snap = FileSnapshot::live();
        let stat = snap.observe(&file).unwrap();
        assert!(!stat.is_dir);
        assert!(snap.exists(&file));
        assert!(snap.observe(dir.path()).unwrap().is_dir);
    }

    #[test]
    fn test_live_in_resolves_relative_paths_against_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("raw")).unwrap();
        std::fs::write(dir.path().join("raw/a.txt"), "x").unwrap();

        let mut snap = FileSnapshot::live_in(dir.path());
        assert!(snap.observe(Path::new("raw/a.txt")).is_some());
        assert!(snap.exists(Path::new("raw/a.txt")));
        assert!(snap.observe(Path::new("raw")).unwrap().is_dir);
        assert!(snap.observe(Path::new("raw/missing.txt")).is_none());

        let absolute = dir.path().join("raw/a.txt");
        assert!(snap.observe(&absolute).is_some());
    }

    #[test]
    fn test_observe_job_records_markers() {
        let rule = Rule::new("index", "build {output}")
            .with_directory_output("dir", "index/{db}", &["done"]);
        let bound = bind(rule, &[("db", "x")]);
        let mut snap = FileSnapshot::fixture();
        snap.observe_job(&bound);
        assert!(snap.entries.contains_key(Path::new("index/x/done")));
    }
}
