//! Skald error types

use std::time::Duration;

/// Skald error types
#[derive(Debug, thiserror::Error)]
pub enum SkaldError {
    // Admission errors
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Option<Duration> },

    #[error("too many failed requests from this caller, retry after {retry_after:?}")]
    TooManyErrors { retry_after: Option<Duration> },

    #[error("text too long: {length} characters, limit is {limit}")]
    TextTooLong { length: usize, limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Capacity errors
    #[error("pipeline pool exhausted, server busy")]
    PoolExhausted,

    #[error("pipeline creation failed: {0}")]
    PipelineCreationFailed(String),

    #[error("check did not finish within {limit:?}")]
    CheckTimeout { limit: Duration },

    #[error("analysis engine error: {0}")]
    Engine(String),

    // Auth errors
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("account lookup failed: {0}")]
    AccountLookup(String),

    // Audit errors, only ever seen by the audit writer
    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),

    /// A sealed pipeline was reconfigured.
    ///
    /// This indicates a bug in the caller, not a runtime condition: sealed
    /// pipelines are shared through the pool and must never change.
    #[error("illegal mutation of sealed pipeline #{pipeline}: {operation}")]
    IllegalPipelineMutation {
        pipeline: u64,
        operation: &'static str,
    },

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SkaldError {
    /// Whether the caller may retry the same request later and expect it
    /// to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SkaldError::RateLimitExceeded { .. }
                | SkaldError::TooManyErrors { .. }
                | SkaldError::PoolExhausted
                | SkaldError::CheckTimeout { .. }
                | SkaldError::AccountLookup(_)
                | SkaldError::AuditWriteFailure(_)
                | SkaldError::Io(_)
        )
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SkaldError::RateLimitExceeded { retry_after }
            | SkaldError::TooManyErrors { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP-style status code a transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            SkaldError::RateLimitExceeded { .. } | SkaldError::TooManyErrors { .. } => 429,
            SkaldError::TextTooLong { .. } => 413,
            SkaldError::InvalidRequest(_) | SkaldError::Json(_) => 400,
            SkaldError::InvalidToken(_) => 401,
            SkaldError::PoolExhausted | SkaldError::CheckTimeout { .. } => 503,
            _ => 500,
        }
    }

    /// Short stable label, used for metrics and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            SkaldError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            SkaldError::TooManyErrors { .. } => "too_many_errors",
            SkaldError::TextTooLong { .. } => "text_too_long",
            SkaldError::InvalidRequest(_) => "invalid_request",
            SkaldError::PoolExhausted => "pool_exhausted",
            SkaldError::PipelineCreationFailed(_) => "pipeline_creation_failed",
            SkaldError::CheckTimeout { .. } => "check_timeout",
            SkaldError::Engine(_) => "engine",
            SkaldError::InvalidToken(_) => "invalid_token",
            SkaldError::AccountLookup(_) => "account_lookup",
            SkaldError::AuditWriteFailure(_) => "audit_write_failure",
            SkaldError::IllegalPipelineMutation { .. } => "illegal_pipeline_mutation",
            SkaldError::Json(_) => "json",
            SkaldError::Io(_) => "io",
            SkaldError::Configuration(_) => "configuration",
        }
    }
}

/// Result type alias for Skald operations
pub type Result<T> = std::result::Result<T, SkaldError>;
