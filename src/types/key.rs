//! Pipeline configuration identity

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// How strict the analysis should be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    #[default]
    Default,
    Picky,
}

/// Rule selection and other options that change how a pipeline is built.
///
/// Sets are ordered so that two option values listing the same rules in a
/// different order compare and hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckOptions {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub enabled_rules: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub disabled_rules: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub enabled_categories: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub disabled_categories: BTreeSet<String>,
    /// Only run the explicitly enabled rules and categories.
    #[serde(default)]
    pub enabled_only: bool,
    #[serde(default)]
    pub level: CheckLevel,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.enabled_rules.insert(rule_id.into());
        self
    }

    pub fn disable_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.disabled_rules.insert(rule_id.into());
        self
    }

    pub fn enable_category(mut self, category: impl Into<String>) -> Self {
        self.enabled_categories.insert(category.into());
        self
    }

    pub fn disable_category(mut self, category: impl Into<String>) -> Self {
        self.disabled_categories.insert(category.into());
        self
    }

    pub fn enabled_only(mut self, enabled_only: bool) -> Self {
        self.enabled_only = enabled_only;
        self
    }

    pub fn level(mut self, level: CheckLevel) -> Self {
        self.level = level;
        self
    }
}

/// Structural identity of a pipeline configuration.
///
/// Two requests with equal keys can share pooled pipelines and cached
/// results. Fields are private: a key never changes once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    language: String,
    mother_tongue: Option<String>,
    options: CheckOptions,
    user_config_hash: u64,
}

impl PipelineKey {
    /// Key for `language` with default options and no user configuration.
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            mother_tongue: None,
            options: CheckOptions::default(),
            user_config_hash: 0,
        }
    }

    pub fn with_mother_tongue(mut self, mother_tongue: impl Into<String>) -> Self {
        self.mother_tongue = Some(mother_tongue.into());
        self
    }

    pub fn with_options(mut self, options: CheckOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_user_config_hash(mut self, hash: u64) -> Self {
        self.user_config_hash = hash;
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn mother_tongue(&self) -> Option<&str> {
        self.mother_tongue.as_deref()
    }

    pub fn options(&self) -> &CheckOptions {
        &self.options
    }

    pub fn user_config_hash(&self) -> u64 {
        self.user_config_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &PipelineKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn rule_order_does_not_matter() {
        let a = PipelineKey::new("en").with_options(
            CheckOptions::new()
                .disable_rule("WHITESPACE_RULE")
                .disable_rule("WORD_REPEAT_RULE"),
        );
        let b = PipelineKey::new("en").with_options(
            CheckOptions::new()
                .disable_rule("WORD_REPEAT_RULE")
                .disable_rule("WHITESPACE_RULE"),
        );
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn user_config_hash_separates_keys() {
        let a = PipelineKey::new("en").with_user_config_hash(1);
        let b = PipelineKey::new("en").with_user_config_hash(2);
        assert_ne!(a, b);
    }

    #[test]
    fn mother_tongue_separates_keys() {
        let a = PipelineKey::new("en");
        let b = PipelineKey::new("en").with_mother_tongue("de");
        assert_ne!(a, b);
        assert_eq!(b.mother_tongue(), Some("de"));
    }
}
