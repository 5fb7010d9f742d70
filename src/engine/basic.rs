//! Small built-in rule engine.
//!
//! Language-agnostic typography rules, enough to run the daemon end to end
//! without an external grammar engine. Real deployments plug their own
//! [`PipelineEngine`] into the builder.

use std::collections::BTreeSet;

use super::{AnalysisHandle, CancellationFlag, PipelineEngine};
use crate::types::{PipelineKey, RuleMatch};
use crate::{Result, SkaldError};

type RuleFn = fn(&[char]) -> Vec<RuleMatch>;

struct Rule {
    id: &'static str,
    category: &'static str,
    check: RuleFn,
}

const RULES: &[Rule] = &[
    Rule {
        id: "WORD_REPEAT_RULE",
        category: "GRAMMAR",
        check: word_repeat,
    },
    Rule {
        id: "WHITESPACE_RULE",
        category: "TYPOGRAPHY",
        check: repeated_whitespace,
    },
    Rule {
        id: "UPPERCASE_SENTENCE_START",
        category: "CASING",
        check: lowercase_sentence_start,
    },
];

/// Engine serving the built-in rules.
#[derive(Debug, Clone, Default)]
pub struct BasicEngine {
    languages: Option<BTreeSet<String>>,
}

impl BasicEngine {
    /// Engine accepting every language.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the engine to the given language codes; building a
    /// pipeline for any other language fails.
    pub fn languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = Some(languages.into_iter().map(Into::into).collect());
        self
    }

    /// Ids of all rules this engine knows.
    pub fn rule_ids() -> impl Iterator<Item = &'static str> {
        RULES.iter().map(|r| r.id)
    }
}

impl PipelineEngine for BasicEngine {
    fn name(&self) -> &str {
        "basic"
    }

    fn build_pipeline(&self, key: &PipelineKey) -> Result<Box<dyn AnalysisHandle>> {
        if let Some(languages) = &self.languages
            && !languages.contains(key.language())
        {
            return Err(SkaldError::Engine(format!(
                "unsupported language: {}",
                key.language()
            )));
        }
        Ok(Box::new(BasicHandle::default()))
    }
}

#[derive(Debug, Default)]
struct BasicHandle {
    enabled_rules: BTreeSet<String>,
    disabled_rules: BTreeSet<String>,
    enabled_categories: BTreeSet<String>,
    disabled_categories: BTreeSet<String>,
    enabled_only: bool,
}

impl BasicHandle {
    fn is_active(&self, rule: &Rule) -> bool {
        if self.disabled_rules.contains(rule.id) {
            return false;
        }
        let explicitly_enabled = self.enabled_rules.contains(rule.id)
            || self.enabled_categories.contains(rule.category);
        if self.enabled_only {
            return explicitly_enabled;
        }
        explicitly_enabled || !self.disabled_categories.contains(rule.category)
    }
}

impl AnalysisHandle for BasicHandle {
    fn enable_rule(&mut self, rule_id: &str) {
        self.enabled_rules.insert(rule_id.to_string());
    }

    fn disable_rule(&mut self, rule_id: &str) {
        self.disabled_rules.insert(rule_id.to_string());
    }

    fn enable_category(&mut self, category: &str) {
        self.enabled_categories.insert(category.to_string());
    }

    fn disable_category(&mut self, category: &str) {
        self.disabled_categories.insert(category.to_string());
    }

    fn set_enabled_only(&mut self, enabled_only: bool) {
        self.enabled_only = enabled_only;
    }

    fn run_check(&mut self, text: &str, cancel: &CancellationFlag) -> Result<Vec<RuleMatch>> {
        let chars: Vec<char> = text.chars().collect();
        let mut matches = Vec::new();
        for rule in RULES.iter().filter(|r| self.is_active(r)) {
            if cancel.is_cancelled() {
                return Err(SkaldError::Engine("check cancelled".into()));
            }
            matches.extend((rule.check)(&chars));
        }
        matches.sort_by_key(|m| m.offset);
        Ok(matches)
    }
}

/// Words as `(start, end)` char ranges.
fn words(chars: &[char]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in chars.iter().enumerate() {
        match (c.is_alphanumeric(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                out.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, chars.len()));
    }
    out
}

fn lowercase(chars: &[char]) -> String {
    chars.iter().flat_map(|c| c.to_lowercase()).collect()
}

fn word_repeat(chars: &[char]) -> Vec<RuleMatch> {
    let words = words(chars);
    words
        .windows(2)
        .filter(|pair| {
            let (a, b) = (pair[0], pair[1]);
            chars[a.1..b.0].iter().all(|c| c.is_whitespace())
                && lowercase(&chars[a.0..a.1]) == lowercase(&chars[b.0..b.1])
        })
        .map(|pair| {
            let (a, b) = (pair[0], pair[1]);
            let word: String = chars[a.0..a.1].iter().collect();
            RuleMatch::new(
                "WORD_REPEAT_RULE",
                "Possible typo: you repeated a word.",
                a.0,
                b.1 - a.0,
            )
            .replacement(word)
        })
        .collect()
}

fn repeated_whitespace(chars: &[char]) -> Vec<RuleMatch> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ' ' {
            let start = i;
            while i < chars.len() && chars[i] == ' ' {
                i += 1;
            }
            if i - start > 1 {
                out.push(
                    RuleMatch::new(
                        "WHITESPACE_RULE",
                        "Possible typo: you repeated a whitespace.",
                        start,
                        i - start,
                    )
                    .replacement(" "),
                );
            }
        } else {
            i += 1;
        }
    }
    out
}

fn lowercase_sentence_start(chars: &[char]) -> Vec<RuleMatch> {
    let mut out = Vec::new();
    for (start, end) in words(chars) {
        let at_sentence_start = chars[..start]
            .iter()
            .rev()
            .find(|c| !c.is_whitespace())
            .is_none_or(|c| matches!(*c, '.' | '!' | '?'));
        // Require whitespace after the terminator so "e.g" and "3.5" pass.
        let separated = start == 0 || chars[start - 1].is_whitespace();
        if at_sentence_start && separated && chars[start].is_lowercase() {
            let word: String = chars[start..end].iter().collect();
            let mut fixed: String = chars[start].to_uppercase().collect();
            fixed.extend(&chars[start + 1..end]);
            out.push(
                RuleMatch::new(
                    "UPPERCASE_SENTENCE_START",
                    format!("This sentence does not start with an uppercase letter: '{word}'."),
                    start,
                    end - start,
                )
                .replacement(fixed),
            );
        }
    }
    out
}
