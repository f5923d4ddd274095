//! Wildcard Path Templates
//!
//! Parses `{name}` placeholders in path templates and provides the three
//! operations the engine needs on them:
//! - matching a concrete path back into a wildcard binding
//! - substituting a binding into a template
//! - expanding enumerations into a set of concrete paths
//!
//! A wildcard always binds a non-empty run of characters that does not
//! contain the path separator `/`. When a template admits more than one
//! binding for a path (several wildcards packed into one segment, e.g.
//! `{a}_{b}.txt` against `x_y_z.txt`) matching fails instead of guessing.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{EngineError, Result};

/// A binding from wildcard name to its concrete value.
pub type Wildcards = BTreeMap<String, String>;

/// Named lists of values that wildcards are expanded over.
pub type Enumerations = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Wildcard(String),
}

/// A parsed path template such as `search/{db}/{dataset}.pin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    tokens: Vec<Token>,
}

impl Template {
    /// Parses a template, rejecting anything that could not be matched back
    /// into a binding.
    ///
    /// # Example
    /// ```
    /// use ruleflow::workflow::wildcards::Template;
    ///
    /// let template = Template::parse("reads/{sample}.fastq").unwrap();
    /// assert_eq!(template.wildcard_names(), vec!["sample"]);
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(EngineError::pattern(raw, "template is empty"));
        }

        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(EngineError::pattern(raw, "unclosed '{'"));
                    }
                    if !is_valid_name(&name) {
                        return Err(EngineError::pattern(
                            raw,
                            format!("invalid wildcard name '{}'", name),
                        ));
                    }
                    if literal.is_empty() && matches!(tokens.last(), Some(Token::Wildcard(_))) {
                        return Err(EngineError::pattern(
                            raw,
                            "adjacent wildcards need a literal separator",
                        ));
                    }
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Wildcard(name));
                }
                '}' => return Err(EngineError::pattern(raw, "unmatched '}'")),
                _ => literal.push(ch),
            }
        }

        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    /// The template text as declared.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Unique wildcard names in order of first appearance.
    pub fn wildcard_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Token::Wildcard(name) if seen.insert(name.as_str()) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_wildcards(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, Token::Wildcard(_)))
    }

    /// Matches a concrete path against this template.
    ///
    /// Returns `Ok(None)` when the path does not fit, and
    /// [`EngineError::AmbiguousRule`] when more than one binding reproduces it.
    pub fn match_path(&self, path: &str) -> Result<Option<Wildcards>> {
        let mut found = Vec::new();
        collect_bindings(&self.tokens, path, &mut Wildcards::new(), &mut found);

        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            _ => Err(EngineError::AmbiguousRule(format!(
                "template '{}' matches '{}' in more than one way ({} / {})",
                self.raw,
                path,
                describe(&found[0]),
                describe(&found[1])
            ))),
        }
    }

    /// Substitutes a complete binding into the template.
    pub fn substitute(&self, wildcards: &Wildcards) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len());
        for token in &self.tokens {
            match token {
                Token::Literal(lit) => out.push_str(lit),
                Token::Wildcard(name) => {
                    let value = wildcards.get(name).ok_or_else(|| {
                        EngineError::pattern(&self.raw, format!("wildcard '{}' is not bound", name))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    /// Replaces the wildcards bound in `wildcards`, leaving the others in place.
    ///
    /// A bound value containing a brace would read back as a wildcard, so it
    /// is rejected.
    pub fn fill(&self, wildcards: &Wildcards) -> Result<Template> {
        let mut raw = String::with_capacity(self.raw.len());
        for token in &self.tokens {
            match token {
                Token::Literal(lit) => raw.push_str(lit),
                Token::Wildcard(name) => match wildcards.get(name) {
                    Some(value) if value.contains(['{', '}']) => {
                        return Err(EngineError::pattern(
                            &self.raw,
                            format!("value '{}' of wildcard '{}' contains a brace", value, name),
                        ));
                    }
                    Some(value) => raw.push_str(value),
                    None => {
                        raw.push('{');
                        raw.push_str(name);
                        raw.push('}');
                    }
                },
            }
        }
        Template::parse(&raw)
    }

    /// Cartesian product over every enumeration the template references.
    ///
    /// Wildcards vary in order of first appearance (the first one slowest),
    /// values in the order they are listed. Duplicate paths are dropped.
    pub fn expand(&self, enumerations: &Enumerations) -> Result<Vec<String>> {
        let names = self.wildcard_names();
        let mut lists = Vec::with_capacity(names.len());
        for name in &names {
            let values = enumerations.get(name).ok_or_else(|| {
                EngineError::pattern(&self.raw, format!("no enumeration named '{}'", name))
            })?;
            lists.push(values);
        }

        let mut combos: Vec<Wildcards> = vec![Wildcards::new()];
        for (name, values) in names.iter().zip(lists) {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(name.clone(), value.clone());
                    next.push(extended);
                }
            }
            combos = next;
        }

        let mut seen = HashSet::new();
        let mut paths = Vec::with_capacity(combos.len());
        for combo in &combos {
            let path = self.substitute(combo)?;
            if seen.insert(path.clone()) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// True when some concrete path is matched by both templates.
    ///
    /// Decided statically by walking the product of the two patterns. Repeated
    /// wildcard names are treated as independent, which can only report
    /// extra overlaps, never miss one.
    pub fn overlaps(&self, other: &Template) -> bool {
        let a = self.atoms();
        let b = other.atoms();

        let mut seen = HashSet::new();
        let mut stack = vec![(0usize, 0usize)];

        while let Some((i, j)) = stack.pop() {
            if !seen.insert((i, j)) {
                continue;
            }
            if i == a.len() && j == b.len() {
                return true;
            }
            if i < a.len() && a[i] == Atom::AnyStar {
                stack.push((i + 1, j));
            }
            if j < b.len() && b[j] == Atom::AnyStar {
                stack.push((i, j + 1));
            }
            if i < a.len() && j < b.len() && a[i].compatible(b[j]) {
                let ni = if a[i] == Atom::AnyStar { i } else { i + 1 };
                let nj = if b[j] == Atom::AnyStar { j } else { j + 1 };
                stack.push((ni, nj));
            }
        }

        false
    }

    fn atoms(&self) -> Vec<Atom> {
        let mut atoms = Vec::new();
        for token in &self.tokens {
            match token {
                Token::Literal(lit) => atoms.extend(lit.chars().map(Atom::Char)),
                Token::Wildcard(_) => {
                    atoms.push(Atom::Any);
                    atoms.push(Atom::AnyStar);
                }
            }
        }
        atoms
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Single-character automaton step used by [`Template::overlaps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Atom {
    Char(char),
    /// Exactly one non-separator character.
    Any,
    /// Zero or more non-separator characters.
    AnyStar,
}

impl Atom {
    fn compatible(self, other: Atom) -> bool {
        match (self, other) {
            (Atom::Char(x), Atom::Char(y)) => x == y,
            (Atom::Char(c), _) | (_, Atom::Char(c)) => c != '/',
            _ => true,
        }
    }
}

/// Expands a template string over named enumerations.
///
/// # Example
/// ```
/// use std::collections::BTreeMap;
/// use ruleflow::workflow::wildcards::expand;
///
/// let mut enums = BTreeMap::new();
/// enums.insert("db".to_string(), vec!["human".to_string(), "yeast".to_string()]);
/// enums.insert("dataset".to_string(), vec!["d1".to_string()]);
///
/// let paths = expand("results/{db}/{dataset}.tsv", &enums).unwrap();
/// assert_eq!(paths, vec!["results/human/d1.tsv", "results/yeast/d1.tsv"]);
/// ```
pub fn expand(template: &str, enumerations: &Enumerations) -> Result<Vec<String>> {
    Template::parse(template)?.expand(enumerations)
}

/// Checks if a string contains wildcard syntax.
pub fn has_wildcards(text: &str) -> bool {
    text.contains('{') && text.contains('}')
}

/// Formats a binding as `name=value,name=value`.
pub fn describe(wildcards: &Wildcards) -> String {
    wildcards
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Collects distinct bindings of `tokens` against `path`, stopping after two.
fn collect_bindings(
    tokens: &[Token],
    path: &str,
    current: &mut Wildcards,
    found: &mut Vec<Wildcards>,
) {
    if found.len() > 1 {
        return;
    }

    let Some((token, rest)) = tokens.split_first() else {
        if path.is_empty() && !found.contains(current) {
            found.push(current.clone());
        }
        return;
    };

    match token {
        Token::Literal(lit) => {
            if let Some(tail) = path.strip_prefix(lit.as_str()) {
                collect_bindings(rest, tail, current, found);
            }
        }
        Token::Wildcard(name) => {
            // A name seen earlier in the template must repeat its value.
            if let Some(bound) = current.get(name).cloned() {
                if let Some(tail) = path.strip_prefix(bound.as_str()) {
                    collect_bindings(rest, tail, current, found);
                }
                return;
            }

            let limit = path.find('/').unwrap_or(path.len());
            let ends = path[..limit]
                .char_indices()
                .map(|(i, _)| i)
                .skip(1)
                .chain(std::iter::once(limit))
                .filter(|&end| end > 0);

            for end in ends {
                current.insert(name.clone(), path[..end].to_string());
                collect_bindings(rest, &path[end..], current, found);
                current.remove(name);
                if found.len() > 1 {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enums(pairs: &[(&str, &[&str])]) -> Enumerations {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn binding(pairs: &[(&str, &str)]) -> Wildcards {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_extracts_names_in_order() {
        let t = Template::parse("{db}/{dataset}_{db}.pin").unwrap();
        assert_eq!(t.wildcard_names(), vec!["db", "dataset"]);
        assert!(t.has_wildcards());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Template::parse("reads/{sample.fastq").is_err());
        assert!(Template::parse("reads/sample}.fastq").is_err());
        assert!(Template::parse("reads/{}.fastq").is_err());
        assert!(Template::parse("reads/{1abc}.fastq").is_err());
        assert!(Template::parse("{a}{b}.txt").is_err());
        assert!(Template::parse("   ").is_err());
    }

    #[test]
    fn test_parse_plain_path() {
        let t = Template::parse("databases/human.fasta").unwrap();
        assert!(!t.has_wildcards());
        assert_eq!(
            t.match_path("databases/human.fasta").unwrap(),
            Some(Wildcards::new())
        );
    }

    #[test]
    fn test_match_single_wildcard() {
        let t = Template::parse("reads/{sample}.fastq").unwrap();
        let wc = t.match_path("reads/s1.fastq").unwrap().unwrap();
        assert_eq!(wc, binding(&[("sample", "s1")]));
    }

    #[test]
    fn test_match_does_not_cross_separator() {
        let t = Template::parse("reads/{sample}.fastq").unwrap();
        assert!(t.match_path("reads/a/b.fastq").unwrap().is_none());
    }

    #[test]
    fn test_match_requires_nonempty_value() {
        let t = Template::parse("reads/{sample}.fastq").unwrap();
        assert!(t.match_path("reads/.fastq").unwrap().is_none());
    }

    #[test]
    fn test_match_wildcard_per_segment() {
        let t = Template::parse("search/{db}/{dataset}.pin").unwrap();
        let wc = t.match_path("search/human/run_01.pin").unwrap().unwrap();
        assert_eq!(wc, binding(&[("db", "human"), ("dataset", "run_01")]));
    }

    #[test]
    fn test_match_unambiguous_multi_wildcard_segment() {
        let t = Template::parse("{a}_{b}.txt").unwrap();
        let wc = t.match_path("x_y.txt").unwrap().unwrap();
        assert_eq!(wc, binding(&[("a", "x"), ("b", "y")]));
    }

    #[test]
    fn test_match_ambiguous_multi_wildcard_segment_is_error() {
        let t = Template::parse("{a}_{b}.txt").unwrap();
        let err = t.match_path("x_y_z.txt").unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousRule(_)));
    }

    #[test]
    fn test_match_repeated_wildcard_must_agree() {
        let t = Template::parse("{s}/{s}.txt").unwrap();
        assert!(t.match_path("a/a.txt").unwrap().is_some());
        assert!(t.match_path("a/b.txt").unwrap().is_none());
    }

    #[test]
    fn test_substitute_and_missing_binding() {
        let t = Template::parse("score/{db}/{dataset}.tsv").unwrap();
        let wc = binding(&[("db", "human"), ("dataset", "d1")]);
        assert_eq!(t.substitute(&wc).unwrap(), "score/human/d1.tsv");

        let partial = binding(&[("db", "human")]);
        assert!(t.substitute(&partial).is_err());
    }

    #[test]
    fn test_fill_leaves_unbound() {
        let t = Template::parse("score/{db}/{dataset}.tsv").unwrap();
        let filled = t.fill(&binding(&[("db", "human")])).unwrap();
        assert_eq!(filled.as_str(), "score/human/{dataset}.tsv");
        assert_eq!(filled.wildcard_names(), vec!["dataset"]);
    }

    #[test]
    fn test_fill_rejects_braced_value() {
        let t = Template::parse("score/{db}/{dataset}.tsv").unwrap();
        let err = t.fill(&binding(&[("db", "a{b")])).unwrap_err();
        assert!(matches!(err, EngineError::Pattern { .. }));
        assert!(err.to_string().contains("a{b"));

        assert!(t.fill(&binding(&[("db", "x}")])).is_err());
        assert!(t.fill(&binding(&[("db", "{dataset}")])).is_err());
    }

    #[test]
    fn test_expand_cross_product_is_m_times_n() {
        let e = enums(&[("db", &["human", "yeast"]), ("dataset", &["d1", "d2", "d3"])]);
        let paths = expand("results/{db}/{dataset}.tsv", &e).unwrap();
        assert_eq!(paths.len(), 6);
        assert_eq!(paths[0], "results/human/d1.tsv");
        assert_eq!(paths[3], "results/yeast/d1.tsv");

        let again = expand("results/{db}/{dataset}.tsv", &e).unwrap();
        assert_eq!(paths, again);
    }

    #[test]
    fn test_expand_deduplicates() {
        let e = enums(&[("db", &["human", "human", "yeast"])]);
        let paths = expand("index/{db}", &e).unwrap();
        assert_eq!(paths, vec!["index/human", "index/yeast"]);
    }

    #[test]
    fn test_expand_missing_enumeration() {
        let e = enums(&[("db", &["human"])]);
        assert!(expand("results/{db}/{dataset}.tsv", &e).is_err());
    }

    #[test]
    fn test_expand_without_wildcards() {
        let paths = expand("summary.tsv", &Enumerations::new()).unwrap();
        assert_eq!(paths, vec!["summary.tsv"]);
    }

    #[test]
    fn test_overlaps_detects_shared_paths() {
        let a = Template::parse("{a}_{b}.txt").unwrap();
        let b = Template::parse("{c}.txt").unwrap();
        assert!(a.overlaps(&b));

        let c = Template::parse("results/{x}.tsv").unwrap();
        let d = Template::parse("results/{y}.tsv").unwrap();
        assert!(c.overlaps(&d));
    }

    #[test]
    fn test_overlaps_respects_separators_and_literals() {
        let a = Template::parse("{c}.txt").unwrap();
        let b = Template::parse("dir/{c}.txt").unwrap();
        assert!(!a.overlaps(&b));

        let c = Template::parse("search/{db}/{dataset}.pin").unwrap();
        let d = Template::parse("search/{db}/{dataset}.tsv").unwrap();
        assert!(!c.overlaps(&d));

        let e = Template::parse("index/{db}").unwrap();
        let f = Template::parse("converted/{db}/{dataset}.mzML").unwrap();
        assert!(!e.overlaps(&f));
    }

    #[test]
    fn test_has_wildcards() {
        assert!(has_wildcards("{sample}.fastq"));
        assert!(has_wildcards("output/{id}.txt"));
        assert!(!has_wildcards("regular_file.txt"));
    }

    #[test]
    fn test_describe_binding() {
        let wc = binding(&[("dataset", "d1"), ("db", "human")]);
        assert_eq!(describe(&wc), "dataset=d1,db=human");
    }
}
