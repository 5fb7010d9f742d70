//! Check result types

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::SkaldError;

/// One potential issue found in the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub message: String,
    /// Character offset into the checked plain text.
    pub offset: usize,
    /// Length in characters.
    pub length: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<String>,
}

impl RuleMatch {
    pub fn new(
        rule_id: impl Into<String>,
        message: impl Into<String>,
        offset: usize,
        length: usize,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
            offset,
            length,
            replacements: Vec::new(),
        }
    }

    pub fn replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacements.push(replacement.into());
        self
    }
}

/// The output of one analysis run; this is what the result cache stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub language: String,
    pub matches: Vec<RuleMatch>,
}

/// What the dispatcher returns for a successful check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResponse {
    pub language: String,
    pub matches: Vec<RuleMatch>,
    /// Served from the result cache without running the engine.
    pub cached: bool,
}

impl CheckResponse {
    pub(crate) fn from_result(result: CheckResult, cached: bool) -> Self {
        Self {
            language: result.language,
            matches: result.matches,
            cached,
        }
    }
}

/// Transport-ready answer: a status code and a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandledResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl From<&SkaldError> for HandledResponse {
    fn from(e: &SkaldError) -> Self {
        Self {
            status: e.status_code(),
            body: json!({
                "error": e.kind(),
                "message": e.to_string(),
                "retryable": e.is_transient(),
                "retry_after_ms": e.retry_after().map(|d| d.as_millis() as u64),
            }),
        }
    }
}
