//! A configured, sealable engine instance.

use std::collections::BTreeSet;
use std::fmt;

use tracing::error;

use crate::engine::{AnalysisHandle, CancellationFlag};
use crate::types::{PipelineKey, RuleMatch};
use crate::{Result, SkaldError};

/// An engine handle plus the rule configuration it was built with.
///
/// A pipeline starts out *building*: rules may be toggled. Once
/// [`seal`](Self::seal)ed it is frozen and every mutator returns
/// [`SkaldError::IllegalPipelineMutation`]. That error means the caller has
/// a bug (pooled pipelines are shared across requests with the same key);
/// it is logged at error level and must not be ignored.
pub struct Pipeline {
    id: u64,
    key: PipelineKey,
    handle: Box<dyn AnalysisHandle>,
    enabled_rules: BTreeSet<String>,
    disabled_rules: BTreeSet<String>,
    sealed: bool,
}

impl Pipeline {
    pub(crate) fn new(id: u64, key: PipelineKey, handle: Box<dyn AnalysisHandle>) -> Self {
        Self {
            id,
            key,
            handle,
            enabled_rules: BTreeSet::new(),
            disabled_rules: BTreeSet::new(),
            sealed: false,
        }
    }

    /// Process-unique instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn enabled_rules(&self) -> &BTreeSet<String> {
        &self.enabled_rules
    }

    pub fn disabled_rules(&self) -> &BTreeSet<String> {
        &self.disabled_rules
    }

    pub fn enable_rule(&mut self, rule_id: &str) -> Result<()> {
        self.ensure_mutable("enable_rule")?;
        self.handle.enable_rule(rule_id);
        self.disabled_rules.remove(rule_id);
        self.enabled_rules.insert(rule_id.to_string());
        Ok(())
    }

    pub fn disable_rule(&mut self, rule_id: &str) -> Result<()> {
        self.ensure_mutable("disable_rule")?;
        self.handle.disable_rule(rule_id);
        self.enabled_rules.remove(rule_id);
        self.disabled_rules.insert(rule_id.to_string());
        Ok(())
    }

    pub fn enable_category(&mut self, category: &str) -> Result<()> {
        self.ensure_mutable("enable_category")?;
        self.handle.enable_category(category);
        Ok(())
    }

    pub fn disable_category(&mut self, category: &str) -> Result<()> {
        self.ensure_mutable("disable_category")?;
        self.handle.disable_category(category);
        Ok(())
    }

    pub fn set_enabled_only(&mut self, enabled_only: bool) -> Result<()> {
        self.ensure_mutable("set_enabled_only")?;
        self.handle.set_enabled_only(enabled_only);
        Ok(())
    }

    /// Apply every rule setting in the pipeline's key.
    pub(crate) fn configure_from_key(&mut self) -> Result<()> {
        let options = self.key.options().clone();
        for category in &options.enabled_categories {
            self.enable_category(category)?;
        }
        for category in &options.disabled_categories {
            self.disable_category(category)?;
        }
        for rule in &options.enabled_rules {
            self.enable_rule(rule)?;
        }
        for rule in &options.disabled_rules {
            self.disable_rule(rule)?;
        }
        self.set_enabled_only(options.enabled_only)
    }

    /// Freeze the configuration. Idempotent.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn run_check(&mut self, text: &str, cancel: &CancellationFlag) -> Result<Vec<RuleMatch>> {
        self.handle.run_check(text, cancel)
    }

    fn ensure_mutable(&self, operation: &'static str) -> Result<()> {
        if self.sealed {
            error!(
                pipeline = self.id,
                operation, "attempt to reconfigure a sealed pipeline"
            );
            return Err(SkaldError::IllegalPipelineMutation {
                pipeline: self.id,
                operation,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("sealed", &self.sealed)
            .finish_non_exhaustive()
    }
}
