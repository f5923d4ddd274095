//! Rule Data Model
//!
//! A [`Rule`] is a declaration: named input/output path templates, an
//! optional log template, parameters, an isolation scope and a command
//! template. Registering a rule compiles it into a [`CompiledRule`], which
//! exposes the uniform contract the engine relies on:
//!
//! - [`CompiledRule::match_output`] recovers a binding from a concrete path
//! - [`CompiledRule::bind`] renders every path and parameter for one binding
//! - [`BoundRule::render_command`] substitutes the command template
//!
//! # Example
//!
//! ```
//! use ruleflow::workflow::Rule;
//!
//! let rule = Rule::new("convert", "msconvert {input.raw} -o {output.spectra}")
//!     .with_input("raw", "raw/{dataset}.raw")
//!     .with_output("spectra", "converted/{dataset}.mzML")
//!     .with_log("logs/convert/{dataset}.log")
//!     .with_threads(2);
//! assert_eq!(rule.name, "convert");
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::workflow::wildcards::{describe, Enumerations, Template, Wildcards};

/// Callback computing a parameter once the binding and outputs are known.
pub type ParamFn = Arc<dyn Fn(&Wildcards, &NamedPaths) -> String + Send + Sync>;

/// A rule parameter: either fixed or derived from the job's binding.
#[derive(Clone)]
pub enum Param {
    Literal(String),
    Computed(ParamFn),
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Param::Computed(_) => f.write_str("Computed(<fn>)"),
        }
    }
}

/// The scope a rule's command executes in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Run directly on the host.
    #[default]
    None,
    /// Run inside a named conda/micromamba environment.
    Conda(String),
    /// Run inside a container image.
    Container(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Every wildcard is bound by the rule's outputs.
    Plain,
    /// Wildcards not bound by the outputs are expanded over enumerations.
    Expand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputKind {
    File,
    /// A directory, complete once every marker (relative to it) exists.
    Directory { markers: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: String,
    pub template: String,
    pub kind: InputKind,
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub template: String,
    pub kind: OutputKind,
}

/// Ordered list of named concrete paths.
///
/// An expanded input contributes several entries under the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedPaths {
    entries: Vec<(String, PathBuf)>,
}

impl NamedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.entries.push((name.into(), path.into()));
    }

    /// First path registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_path())
    }

    /// Every path registered under `name`.
    pub fn get_all(&self, name: &str) -> Vec<&Path> {
        self.entries
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, p)| p.as_path())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p.as_path()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|(_, p)| p.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn joined(paths: &[&Path]) -> String {
        paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A rule declaration, as written by the pipeline author.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique rule name
    pub name: String,

    /// Named input path templates, in declaration order
    pub inputs: Vec<InputSpec>,

    /// Named output path templates, in declaration order
    pub outputs: Vec<OutputSpec>,

    /// Optional log path template
    pub log: Option<String>,

    /// Named parameters
    pub params: Vec<(String, Param)>,

    /// Where the command runs
    pub isolation: Isolation,

    /// Command template with `{input.NAME}`-style placeholders
    pub command: String,

    /// Scheduling weight (cores) of one job of this rule
    pub threads: usize,

    /// When the rule was last changed; outputs older than this are stale
    pub declared_at: Option<SystemTime>,
}

impl Rule {
    /// Creates a rule with a name and command template.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            log: None,
            params: Vec::new(),
            isolation: Isolation::None,
            command: command.into().trim().to_string(),
            threads: 1,
            declared_at: None,
        }
    }

    /// Adds a named input whose wildcards are all bound by the outputs.
    pub fn with_input(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.inputs.push(InputSpec {
            name: name.into(),
            template: template.into(),
            kind: InputKind::Plain,
        });
        self
    }

    /// Adds a named input expanded over enumerations for unbound wildcards.
    pub fn with_expanded_input(
        mut self,
        name: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.inputs.push(InputSpec {
            name: name.into(),
            template: template.into(),
            kind: InputKind::Expand,
        });
        self
    }

    /// Adds a named file output.
    pub fn with_output(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            template: template.into(),
            kind: OutputKind::File,
        });
        self
    }

    /// Adds a directory-valued output whose completeness is signalled by markers.
    pub fn with_directory_output(
        mut self,
        name: impl Into<String>,
        template: impl Into<String>,
        markers: &[&str],
    ) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            template: template.into(),
            kind: OutputKind::Directory {
                markers: markers.iter().map(|m| m.to_string()).collect(),
            },
        });
        self
    }

    pub fn with_log(mut self, template: impl Into<String>) -> Self {
        self.log = Some(template.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), Param::Literal(value.into())));
        self
    }

    /// Adds a parameter computed from the binding and rendered outputs.
    pub fn with_computed_param<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Wildcards, &NamedPaths) -> String + Send + Sync + 'static,
    {
        self.params.push((name.into(), Param::Computed(Arc::new(f))));
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_conda_env(self, env: impl Into<String>) -> Self {
        self.with_isolation(Isolation::Conda(env.into()))
    }

    pub fn with_container(self, image: impl Into<String>) -> Self {
        self.with_isolation(Isolation::Container(image.into()))
    }

    /// Sets the thread count for jobs of this rule.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn declared_at(mut self, at: SystemTime) -> Self {
        self.declared_at = Some(at);
        self
    }
}

#[derive(Debug, Clone)]
struct CompiledInput {
    name: String,
    template: Template,
    kind: InputKind,
}

#[derive(Debug, Clone)]
struct CompiledOutput {
    name: String,
    template: Template,
    kind: CompiledOutputKind,
}

#[derive(Debug, Clone)]
enum CompiledOutputKind {
    File,
    Directory { markers: Vec<Template> },
}

/// A validated rule with parsed templates.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: Rule,
    inputs: Vec<CompiledInput>,
    outputs: Vec<CompiledOutput>,
    log: Option<Template>,
    wildcard_names: BTreeSet<String>,
}

impl CompiledRule {
    /// Parses and validates a rule declaration.
    ///
    /// `enumerations` resolves the free wildcards of expanded inputs.
    pub fn compile(rule: Rule, enumerations: &Enumerations) -> Result<Self> {
        if rule.name.is_empty()
            || !rule
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::pattern(&rule.name, "invalid rule name"));
        }
        if rule.outputs.is_empty() {
            return Err(EngineError::pattern(&rule.name, "rule declares no outputs"));
        }

        let mut names = HashSet::new();
        for name in rule
            .inputs
            .iter()
            .map(|i| &i.name)
            .chain(rule.outputs.iter().map(|o| &o.name))
        {
            // Expanded inputs reuse their name for every path, declared once.
            if !names.insert(("io", name.clone())) {
                return Err(EngineError::pattern(
                    &rule.name,
                    format!("duplicate input/output name '{}'", name),
                ));
            }
        }
        for (name, _) in &rule.params {
            if !names.insert(("param", name.clone())) {
                return Err(EngineError::pattern(
                    &rule.name,
                    format!("duplicate parameter '{}'", name),
                ));
            }
        }

        let mut outputs = Vec::with_capacity(rule.outputs.len());
        let mut wildcard_names: Option<BTreeSet<String>> = None;
        for spec in &rule.outputs {
            let template = Template::parse(&spec.template)?;
            let set: BTreeSet<String> = template.wildcard_names().into_iter().collect();
            match &wildcard_names {
                None => wildcard_names = Some(set),
                Some(first) if *first != set => {
                    return Err(EngineError::pattern(
                        &spec.template,
                        format!(
                            "outputs of rule '{}' must use the same wildcards",
                            rule.name
                        ),
                    ));
                }
                Some(_) => {}
            }
            if outputs
                .iter()
                .any(|o: &CompiledOutput| o.template == template)
            {
                return Err(EngineError::pattern(
                    &spec.template,
                    format!("output declared twice in rule '{}'", rule.name),
                ));
            }
            let kind = match &spec.kind {
                OutputKind::File => CompiledOutputKind::File,
                OutputKind::Directory { markers } => {
                    let mut parsed = Vec::with_capacity(markers.len());
                    for marker in markers {
                        let t = Template::parse(marker)?;
                        if marker.starts_with('/') || marker.split('/').any(|s| s == "..") {
                            return Err(EngineError::pattern(
                                marker,
                                "marker must be relative to its directory",
                            ));
                        }
                        parsed.push(t);
                    }
                    CompiledOutputKind::Directory { markers: parsed }
                }
            };
            outputs.push(CompiledOutput {
                name: spec.name.clone(),
                template,
                kind,
            });
        }
        let wildcard_names = wildcard_names.unwrap_or_default();

        for output in &outputs {
            if let CompiledOutputKind::Directory { markers } = &output.kind {
                for marker in markers {
                    check_bound(marker, &wildcard_names, &rule.name)?;
                }
            }
        }

        let mut inputs = Vec::with_capacity(rule.inputs.len());
        for spec in &rule.inputs {
            let template = Template::parse(&spec.template)?;
            match spec.kind {
                InputKind::Plain => check_bound(&template, &wildcard_names, &rule.name)?,
                InputKind::Expand => {
                    for name in template.wildcard_names() {
                        if !wildcard_names.contains(&name) && !enumerations.contains_key(&name) {
                            return Err(EngineError::pattern(
                                &spec.template,
                                format!(
                                    "wildcard '{}' is neither an output wildcard nor an enumeration",
                                    name
                                ),
                            ));
                        }
                    }
                }
            }
            inputs.push(CompiledInput {
                name: spec.name.clone(),
                template,
                kind: spec.kind,
            });
        }

        let log = match &rule.log {
            Some(raw) => {
                let t = Template::parse(raw)?;
                check_bound(&t, &wildcard_names, &rule.name)?;
                Some(t)
            }
            None => None,
        };

        let compiled = Self {
            rule,
            inputs,
            outputs,
            log,
            wildcard_names,
        };
        compiled.check_command()?;
        Ok(compiled)
    }

    pub fn name(&self) -> &str {
        &self.rule.name
    }

    /// The original declaration.
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Parsed output templates, in declaration order.
    pub fn output_templates(&self) -> impl Iterator<Item = &Template> {
        self.outputs.iter().map(|o| &o.template)
    }

    pub fn wildcard_names(&self) -> &BTreeSet<String> {
        &self.wildcard_names
    }

    /// Matches `path` against every output template of this rule.
    pub fn match_output(&self, path: &str) -> Result<Option<Wildcards>> {
        let mut found: Option<Wildcards> = None;
        for output in &self.outputs {
            if let Some(wc) = output.template.match_path(path)? {
                match &found {
                    Some(prev) if *prev != wc => {
                        return Err(EngineError::AmbiguousRule(format!(
                            "rule '{}' produces '{}' under two bindings ({} / {})",
                            self.name(),
                            path,
                            describe(prev),
                            describe(&wc)
                        )));
                    }
                    _ => found = Some(wc),
                }
            }
        }
        Ok(found)
    }

    /// Renders every concrete path and parameter for one binding.
    ///
    /// Computed parameters are invoked here, exactly once per binding.
    pub fn bind(
        self: &Arc<Self>,
        wildcards: &Wildcards,
        enumerations: &Enumerations,
    ) -> Result<BoundRule> {
        let mut outputs = NamedPaths::new();
        let mut directories = Vec::new();
        for output in &self.outputs {
            let path = PathBuf::from(output.template.substitute(wildcards)?);
            if let CompiledOutputKind::Directory { markers } = &output.kind {
                let mut rendered = Vec::with_capacity(markers.len());
                for marker in markers {
                    rendered.push(path.join(marker.substitute(wildcards)?));
                }
                directories.push(DirectoryOutput {
                    path: path.clone(),
                    markers: rendered,
                });
            }
            outputs.push(output.name.clone(), path);
        }

        let mut inputs = NamedPaths::new();
        for input in &self.inputs {
            match input.kind {
                InputKind::Plain => {
                    inputs.push(input.name.clone(), input.template.substitute(wildcards)?);
                }
                InputKind::Expand => {
                    for path in input.template.fill(wildcards)?.expand(enumerations)? {
                        inputs.push(input.name.clone(), path);
                    }
                }
            }
        }

        let log = match &self.log {
            Some(t) => Some(PathBuf::from(t.substitute(wildcards)?)),
            None => None,
        };

        let params = self
            .rule
            .params
            .iter()
            .map(|(name, param)| {
                let value = match param {
                    Param::Literal(v) => v.clone(),
                    Param::Computed(f) => f(wildcards, &outputs),
                };
                (name.clone(), value)
            })
            .collect();

        Ok(BoundRule {
            rule: Arc::clone(self),
            wildcards: wildcards.clone(),
            inputs,
            outputs,
            directories,
            log,
            params,
        })
    }

    fn check_command(&self) -> Result<()> {
        let input_names: HashSet<&str> = self.inputs.iter().map(|i| i.name.as_str()).collect();
        let output_names: HashSet<&str> = self.outputs.iter().map(|o| o.name.as_str()).collect();
        let param_names: HashSet<&str> = self.rule.params.iter().map(|(n, _)| n.as_str()).collect();
        let has_log = self.log.is_some();

        render_placeholders(&self.rule.command, |key| {
            let known = match key.split_once('.') {
                None => matches!(key, "input" | "output" | "threads") || (key == "log" && has_log),
                Some(("input", n)) => input_names.contains(n),
                Some(("output", n)) => output_names.contains(n),
                Some(("params", n)) => param_names.contains(n),
                Some(("wildcards", n)) => self.wildcard_names.contains(n),
                Some(_) => false,
            };
            known.then(String::new)
        })
        .map(|_| ())
    }
}

fn check_bound(template: &Template, bound: &BTreeSet<String>, rule: &str) -> Result<()> {
    for name in template.wildcard_names() {
        if !bound.contains(&name) {
            return Err(EngineError::pattern(
                template.as_str(),
                format!(
                    "wildcard '{}' is not bound by the outputs of rule '{}'",
                    name, rule
                ),
            ));
        }
    }
    Ok(())
}

/// A directory-valued output and the marker files proving it complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryOutput {
    pub path: PathBuf,
    pub markers: Vec<PathBuf>,
}

/// A rule bound to one wildcard binding.
#[derive(Debug, Clone)]
pub struct BoundRule {
    pub rule: Arc<CompiledRule>,
    pub wildcards: Wildcards,
    pub inputs: NamedPaths,
    pub outputs: NamedPaths,
    pub directories: Vec<DirectoryOutput>,
    pub log: Option<PathBuf>,
    pub params: Vec<(String, String)>,
}

impl BoundRule {
    /// Renders the command template with `threads` for `{threads}`.
    ///
    /// `outputs` replaces the bound outputs, so the runner can point file
    /// outputs at temporary locations.
    pub fn render_command(&self, outputs: &NamedPaths, threads: usize) -> Result<String> {
        let rule = self.rule.rule();
        render_placeholders(&rule.command, |key| match key.split_once('.') {
            None => match key {
                "input" => Some(NamedPaths::joined(&self.inputs.paths().collect::<Vec<_>>())),
                "output" => Some(NamedPaths::joined(&outputs.paths().collect::<Vec<_>>())),
                "threads" => Some(threads.to_string()),
                "log" => self.log.as_ref().map(|p| p.display().to_string()),
                _ => None,
            },
            Some(("input", n)) => {
                let all = self.inputs.get_all(n);
                (!all.is_empty()).then(|| NamedPaths::joined(&all))
            }
            Some(("output", n)) => {
                let all = outputs.get_all(n);
                (!all.is_empty()).then(|| NamedPaths::joined(&all))
            }
            Some(("params", n)) => self
                .params
                .iter()
                .find(|(name, _)| name == n)
                .map(|(_, v)| v.clone()),
            Some(("wildcards", n)) => self.wildcards.get(n).cloned(),
            Some(_) => None,
        })
    }

    /// Whether `path` is a directory-valued output.
    pub fn is_directory_output(&self, path: &Path) -> bool {
        self.directories.iter().any(|d| d.path == path)
    }
}

/// Substitutes `{key}` placeholders in a command template.
///
/// `{{` and `}}` produce literal braces. An unknown key is a pattern error.
fn render_placeholders<F>(template: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    key.push(inner);
                }
                if !closed {
                    return Err(EngineError::pattern(template, "unclosed '{' in command"));
                }
                let value = lookup(key.trim()).ok_or_else(|| {
                    EngineError::pattern(template, format!("unknown placeholder '{{{}}}'", key))
                })?;
                out.push_str(&value);
            }
            '}' => {
                return Err(EngineError::pattern(
                    template,
                    "unmatched '}' in command (use '}}' for a literal brace)",
                ))
            }
            _ => out.push(ch),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn enums() -> Enumerations {
        let mut e = Enumerations::new();
        e.insert(
            "dataset".to_string(),
            vec!["d1".to_string(), "d2".to_string()],
        );
        e
    }

    fn wc(pairs: &[(&str, &str)]) -> Wildcards {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn search_rule() -> Rule {
        Rule::new(
            "search",
            "comet -P{params.config} -D{input.index} {input.spectra} > {output.pin} 2> {log}",
        )
        .with_input("spectra", "converted/{db}/{dataset}.mzML")
        .with_input("index", "index/{db}")
        .with_output("pin", "search/{db}/{dataset}.pin")
        .with_log("logs/search/{db}/{dataset}.log")
        .with_param("config", "comet.params")
        .with_threads(4)
    }

    #[test]
    fn test_rule_builder() {
        let rule = search_rule();
        assert_eq!(rule.name, "search");
        assert_eq!(rule.inputs.len(), 2);
        assert_eq!(rule.outputs.len(), 1);
        assert_eq!(rule.threads, 4);
        assert_eq!(rule.isolation, Isolation::None);
    }

    #[test]
    fn test_threads_never_zero() {
        let rule = Rule::new("r", "true").with_threads(0);
        assert_eq!(rule.threads, 1);
    }

    #[test]
    fn test_compile_valid_rule() {
        let compiled = CompiledRule::compile(search_rule(), &enums()).unwrap();
        assert_eq!(compiled.name(), "search");
        let names: Vec<_> = compiled.wildcard_names().iter().cloned().collect();
        assert_eq!(names, vec!["dataset", "db"]);
    }

    #[test]
    fn test_compile_rejects_no_outputs() {
        let rule = Rule::new("empty", "true");
        assert!(matches!(
            CompiledRule::compile(rule, &enums()),
            Err(EngineError::Pattern { .. })
        ));
    }

    #[test]
    fn test_compile_rejects_unbound_input_wildcard() {
        let rule = Rule::new("r", "cat {input} > {output}")
            .with_input("a", "in/{sample}.txt")
            .with_output("b", "out/{other}.txt");
        assert!(CompiledRule::compile(rule, &enums()).is_err());
    }

    #[test]
    fn test_compile_rejects_mismatched_output_wildcards() {
        let rule = Rule::new("r", "true")
            .with_output("a", "out/{x}.txt")
            .with_output("b", "out/{x}_{y}.txt");
        assert!(CompiledRule::compile(rule, &enums()).is_err());
    }

    #[test]
    fn test_compile_rejects_unknown_placeholder() {
        let rule = Rule::new("r", "cat {input.missing} > {output}")
            .with_input("a", "in/{x}.txt")
            .with_output("b", "out/{x}.txt");
        let err = CompiledRule::compile(rule, &enums()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_compile_rejects_log_placeholder_without_log() {
        let rule = Rule::new("r", "true 2> {log}").with_output("b", "out/{x}.txt");
        assert!(CompiledRule::compile(rule, &enums()).is_err());
    }

    #[test]
    fn test_compile_rejects_expanded_input_without_enumeration() {
        let rule = Rule::new("r", "cat {input} > {output}")
            .with_expanded_input("all", "score/{db}/{sample}.tsv")
            .with_output("b", "agg/{db}.tsv");
        assert!(CompiledRule::compile(rule, &enums()).is_err());
    }

    #[test]
    fn test_compile_rejects_duplicate_names() {
        let rule = Rule::new("r", "true")
            .with_input("x", "in/{a}.txt")
            .with_output("x", "out/{a}.txt");
        assert!(CompiledRule::compile(rule, &enums()).is_err());
    }

    #[test]
    fn test_match_output() {
        let compiled = CompiledRule::compile(search_rule(), &enums()).unwrap();
        let found = compiled.match_output("search/human/d1.pin").unwrap();
        assert_eq!(found, Some(wc(&[("db", "human"), ("dataset", "d1")])));
        assert!(compiled.match_output("search/human/d1.tsv").unwrap().is_none());
    }

    #[test]
    fn test_bind_renders_paths_and_command() {
        let compiled = Arc::new(CompiledRule::compile(search_rule(), &enums()).unwrap());
        let bound = compiled
            .bind(&wc(&[("db", "human"), ("dataset", "d1")]), &enums())
            .unwrap();

        assert_eq!(
            bound.inputs.get("spectra"),
            Some(Path::new("converted/human/d1.mzML"))
        );
        assert_eq!(bound.outputs.get("pin"), Some(Path::new("search/human/d1.pin")));
        assert_eq!(bound.log, Some(PathBuf::from("logs/search/human/d1.log")));

        let command = bound.render_command(&bound.outputs, 1).unwrap();
        assert_eq!(
            command,
            "comet -Pcomet.params -Dindex/human converted/human/d1.mzML > search/human/d1.pin 2> logs/search/human/d1.log"
        );
    }

    #[test]
    fn test_bind_expanded_input() {
        let rule = Rule::new("aggregate", "cat {input.scores} > {output.table}")
            .with_expanded_input("scores", "score/{db}/{dataset}.tsv")
            .with_output("table", "results/{db}.tsv");
        let compiled = Arc::new(CompiledRule::compile(rule, &enums()).unwrap());
        let bound = compiled.bind(&wc(&[("db", "yeast")]), &enums()).unwrap();

        assert_eq!(bound.inputs.len(), 2);
        let command = bound.render_command(&bound.outputs, 1).unwrap();
        assert_eq!(
            command,
            "cat score/yeast/d1.tsv score/yeast/d2.tsv > results/yeast.tsv"
        );
    }

    #[test]
    fn test_bind_rejects_braced_value_in_expanded_input() {
        let rule = Rule::new("aggregate", "cat {input.scores} > {output.table}")
            .with_expanded_input("scores", "score/{db}/{dataset}.tsv")
            .with_output("table", "results/{db}.tsv");
        let compiled = Arc::new(CompiledRule::compile(rule, &enums()).unwrap());

        let err = compiled.bind(&wc(&[("db", "a{b")]), &enums()).unwrap_err();
        assert!(matches!(err, EngineError::Pattern { .. }));
    }

    #[test]
    fn test_computed_param_invoked_once_at_bind() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let rule = Rule::new("score", "score --prefix {params.prefix} > {output.scores}")
            .with_output("scores", "score/{db}/{dataset}.tsv")
            .with_computed_param("prefix", move |wc, outputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                format!(
                    "{}-{}",
                    wc["dataset"],
                    outputs.get("scores").unwrap().display()
                )
            });
        let compiled = Arc::new(CompiledRule::compile(rule, &enums()).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let bound = compiled
            .bind(&wc(&[("db", "human"), ("dataset", "d2")]), &enums())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let first = bound.render_command(&bound.outputs, 1).unwrap();
        let second = bound.render_command(&bound.outputs, 1).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("d2-score/human/d2.tsv"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_directory_output_markers() {
        let rule = Rule::new("index", "build {input} {output.dir}")
            .with_input("fasta", "databases/{db}.fasta")
            .with_directory_output("dir", "index/{db}", &["{db}.idx", "done.txt"]);
        let compiled = Arc::new(CompiledRule::compile(rule, &enums()).unwrap());
        let bound = compiled.bind(&wc(&[("db", "human")]), &enums()).unwrap();

        assert_eq!(bound.directories.len(), 1);
        assert_eq!(
            bound.directories[0].markers,
            vec![
                PathBuf::from("index/human/human.idx"),
                PathBuf::from("index/human/done.txt")
            ]
        );
        assert!(bound.is_directory_output(Path::new("index/human")));
    }

    #[test]
    fn test_literal_braces_in_command() {
        let rule = Rule::new("r", "awk '{{print $1}}' {input} > {output}")
            .with_input("a", "in/{x}.txt")
            .with_output("b", "out/{x}.txt");
        let compiled = Arc::new(CompiledRule::compile(rule, &enums()).unwrap());
        let bound = compiled.bind(&wc(&[("x", "1")]), &enums()).unwrap();
        assert_eq!(
            bound.render_command(&bound.outputs, 1).unwrap(),
            "awk '{print $1}' in/1.txt > out/1.txt"
        );
    }

    #[test]
    fn test_wildcards_and_threads_placeholders() {
        let rule = Rule::new("r", "tool --id {wildcards.x} -t {threads} > {output}")
            .with_output("b", "out/{x}.txt")
            .with_threads(3);
        let compiled = Arc::new(CompiledRule::compile(rule, &enums()).unwrap());
        let bound = compiled.bind(&wc(&[("x", "abc")]), &enums()).unwrap();
        assert_eq!(
            bound.render_command(&bound.outputs, 3).unwrap(),
            "tool --id abc -t 3 > out/abc.txt"
        );
        assert_eq!(
            bound.render_command(&bound.outputs, 2).unwrap(),
            "tool --id abc -t 2 > out/abc.txt"
        );
    }

    #[test]
    fn test_param_debug_hides_closure() {
        let p = Param::Computed(Arc::new(|_: &Wildcards, _: &NamedPaths| String::new()));
        assert_eq!(format!("{:?}", p), "Computed(<fn>)");
    }
}
