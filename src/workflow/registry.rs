//! Rule Registry and Pattern Resolver
//!
//! Rules are registered once at startup and are immutable afterwards. The
//! registry guarantees that no two output templates can claim the same
//! concrete path, so resolving a path never depends on registration order.

use std::sync::Arc;

use log::{debug, info};

use crate::error::{EngineError, Result};
use crate::workflow::config::PipelineConfig;
use crate::workflow::model::{CompiledRule, Rule};
use crate::workflow::wildcards::{describe, Template, Wildcards};

/// The set of registered rules plus the configuration they were compiled against.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    config: Arc<PipelineConfig>,
    rules: Vec<Arc<CompiledRule>>,
}

impl RuleRegistry {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self {
            config,
            rules: Vec::new(),
        }
    }

    /// Validates and registers a rule.
    ///
    /// Fails with [`EngineError::Pattern`] for malformed templates and with
    /// [`EngineError::AmbiguousRule`] when an output template overlaps one
    /// already registered.
    pub fn register(&mut self, mut rule: Rule) -> Result<Arc<CompiledRule>> {
        if self.rule(&rule.name).is_some() {
            return Err(EngineError::AmbiguousRule(format!(
                "rule '{}' is declared twice",
                rule.name
            )));
        }
        if rule.declared_at.is_none() {
            rule.declared_at = self.config.declared_at;
        }

        let compiled = CompiledRule::compile(rule, &self.config.enumerations)?;

        for existing in &self.rules {
            for theirs in existing.output_templates() {
                if let Some(ours) = compiled.output_templates().find(|t| t.overlaps(theirs)) {
                    return Err(EngineError::AmbiguousRule(format!(
                        "output '{}' of rule '{}' can match the same path as output '{}' of rule '{}'",
                        ours,
                        compiled.name(),
                        theirs,
                        existing.name()
                    )));
                }
            }
        }

        debug!(
            "Registered rule '{}' ({} inputs, {} outputs)",
            compiled.name(),
            compiled.rule().inputs.len(),
            compiled.rule().outputs.len()
        );

        let compiled = Arc::new(compiled);
        self.rules.push(Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Registers every rule, stopping at the first error.
    pub fn register_all(&mut self, rules: impl IntoIterator<Item = Rule>) -> Result<()> {
        for rule in rules {
            self.register(rule)?;
        }
        info!("Rule registry ready: {} rules", self.rules.len());
        Ok(())
    }

    /// All registered rules, in registration order.
    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<CompiledRule>> {
        self.rules.iter().find(|r| r.name() == name)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Finds the rule producing `path` and the binding that reproduces it.
    ///
    /// More than one candidate (two rules, or two bindings of one template)
    /// is an [`EngineError::AmbiguousRule`].
    pub fn resolve(&self, path: &str) -> Result<Option<(Arc<CompiledRule>, Wildcards)>> {
        let mut found: Option<(Arc<CompiledRule>, Wildcards)> = None;

        for rule in &self.rules {
            if let Some(wildcards) = rule.match_output(path)? {
                if let Some((prev, prev_wc)) = &found {
                    return Err(EngineError::AmbiguousRule(format!(
                        "'{}' is produced by both '{}' ({}) and '{}' ({})",
                        path,
                        prev.name(),
                        describe(prev_wc),
                        rule.name(),
                        describe(&wildcards)
                    )));
                }
                found = Some((Arc::clone(rule), wildcards));
            }
        }

        Ok(found)
    }

    /// Expands a target template over the configured enumerations.
    pub fn expand(&self, template: &str) -> Result<Vec<String>> {
        Template::parse(template)?.expand(&self.config.enumerations)
    }
}
