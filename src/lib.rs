//! Skald - concurrent request-serving layer for a text checking service
//!
//! This crate sits between a transport (HTTP, stdio, ...) and an analysis
//! engine. It makes repeated, concurrent, possibly abusive and possibly
//! identical check requests cheap and safe to serve, even though engine
//! pipelines are expensive to build and unsafe to share.
//!
//! Per request the [`Dispatcher`] resolves the caller's quota, applies the
//! rate limiters, probes the result cache, checks a pipeline out of the
//! pool, runs the engine under a deadline, caches the result and enqueues
//! an audit record.
//!
//! # Example
//!
//! ```rust,no_run
//! use skald::{BasicEngine, CacheConfig, RequestContext, Skald};
//!
//! #[tokio::main]
//! async fn main() -> skald::Result<()> {
//!     let dispatcher = Skald::builder()
//!         .engine(BasicEngine::new())
//!         .result_cache(CacheConfig::default())
//!         .build()?;
//!
//!     let response = dispatcher
//!         .check(RequestContext::new("This is is a test.", "en"))
//!         .await?;
//!
//!     for m in &response.matches {
//!         println!("{} at {}: {}", m.rule_id, m.offset, m.message);
//!     }
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod quota;
pub mod service;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use error::{Result, SkaldError};
pub use service::{Dispatcher, Skald, SkaldBuilder};

pub use audit::{
    AuditConfig, AuditLogger, AuditOutcome, AuditRecord, AuditSink, AuditStats, IdentityClass,
    JsonLinesSink, RetryConfig,
};
pub use cache::{CacheConfig, Fingerprint, ResultCache};
pub use engine::{AnalysisHandle, BasicEngine, CancellationFlag, PipelineEngine};
pub use limiter::{ErrorRequestLimiter, LimiterConfig, RequestLimiter};
pub use pool::{Pipeline, PipelineLease, PipelinePool, PoolConfig, PoolStats};
pub use quota::{
    AccountLimitsLookup, Claims, HttpAccountLookup, JwtVerifier, QuotaConfig, QuotaResolver,
    TokenVerifier,
};

// Re-export all types
pub use types::{
    CallerIdentity, CheckLevel, CheckOptions, CheckResponse, CheckResult, HandledResponse,
    LimitsSource, PipelineKey, RequestContext, RuleMatch, TextInput, TextSegment, UserConfig,
    UserLimits,
};
