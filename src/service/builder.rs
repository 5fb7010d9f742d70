//! Builder for configuring dispatcher instances

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::Dispatcher;
use crate::audit::{AuditConfig, AuditLogger, AuditSink};
use crate::cache::{CacheConfig, ResultCache};
use crate::engine::PipelineEngine;
use crate::limiter::{ErrorRequestLimiter, LimiterConfig, RequestLimiter};
use crate::pool::{PipelinePool, PoolConfig};
use crate::quota::{AccountLimitsLookup, JwtVerifier, QuotaConfig, QuotaResolver, TokenVerifier};
use crate::{Result, SkaldError};

/// Default engine time budget when neither the caller's limits nor the
/// request set one.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(20);

/// Main entry point for creating dispatcher instances.
pub struct Skald;

impl Skald {
    /// Create a new builder for configuring the dispatcher.
    pub fn builder() -> SkaldBuilder {
        SkaldBuilder::new()
    }
}

/// Builder for configuring dispatcher instances.
///
/// Only the engine is required. The result cache and audit log are off
/// unless configured.
pub struct SkaldBuilder {
    engine: Option<Arc<dyn PipelineEngine>>,
    pool: PoolConfig,
    cache: Option<CacheConfig>,
    request_limits: LimiterConfig,
    error_limits: LimiterConfig,
    quota: QuotaConfig,
    verifier: Option<Arc<dyn TokenVerifier>>,
    account_lookup: Option<Arc<dyn AccountLimitsLookup>>,
    audit: Option<(Arc<dyn AuditSink>, AuditConfig)>,
    default_check_timeout: Duration,
}

impl SkaldBuilder {
    pub fn new() -> Self {
        Self {
            engine: None,
            pool: PoolConfig::default(),
            cache: None,
            request_limits: LimiterConfig::default(),
            error_limits: LimiterConfig::new(10, Duration::from_secs(60)),
            quota: QuotaConfig::default(),
            verifier: None,
            account_lookup: None,
            audit: None,
            default_check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    /// Analysis engine that builds pipelines.
    pub fn engine(mut self, engine: impl PipelineEngine + 'static) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// Shared analysis engine.
    pub fn shared_engine(mut self, engine: Arc<dyn PipelineEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Enable the result cache.
    pub fn result_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn request_limits(mut self, config: LimiterConfig) -> Self {
        self.request_limits = config;
        self
    }

    pub fn error_limits(mut self, config: LimiterConfig) -> Self {
        self.error_limits = config;
        self
    }

    pub fn quota(mut self, config: QuotaConfig) -> Self {
        self.quota = config;
        self
    }

    /// Verify bearer tokens as HS256 JWTs signed with `secret`.
    pub fn token_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.verifier = Some(Arc::new(JwtVerifier::new(secret.as_ref())));
        self
    }

    /// Verify bearer tokens with a custom verifier.
    pub fn token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn account_lookup(mut self, lookup: Arc<dyn AccountLimitsLookup>) -> Self {
        self.account_lookup = Some(lookup);
        self
    }

    /// Enable the audit log.
    pub fn audit(mut self, sink: Arc<dyn AuditSink>, config: AuditConfig) -> Self {
        self.audit = Some((sink, config));
        self
    }

    pub fn default_check_timeout(mut self, timeout: Duration) -> Self {
        self.default_check_timeout = timeout;
        self
    }

    /// Build the dispatcher and start its background tasks (pool sweep,
    /// limiter sweep, audit writer).
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Dispatcher> {
        let engine = self
            .engine
            .ok_or_else(|| SkaldError::Configuration("no analysis engine configured".into()))?;
        validate(&self.pool, &self.request_limits, &self.error_limits, self.default_check_timeout)?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(SkaldError::Configuration(
                "dispatcher must be built inside a tokio runtime".into(),
            ));
        }

        let pool = PipelinePool::new(engine, &self.pool);
        let request_limiter = Arc::new(RequestLimiter::with_config(self.request_limits));
        let error_limiter = Arc::new(ErrorRequestLimiter::with_config(self.error_limits));

        let mut quota = QuotaResolver::new(self.quota);
        if let Some(verifier) = self.verifier {
            quota = quota.with_verifier(verifier);
        }
        if let Some(lookup) = self.account_lookup {
            quota = quota.with_account_lookup(lookup);
        }

        let cache = self.cache.as_ref().map(ResultCache::new);
        let audit = self
            .audit
            .map(|(sink, config)| AuditLogger::spawn(sink, config));

        let tasks = vec![
            pool.spawn_sweeper(self.pool.sweep_interval),
            super::dispatcher::spawn_limiter_sweeper(
                &request_limiter,
                &error_limiter,
                self.pool.sweep_interval,
            ),
        ];

        info!(
            max_pipelines = self.pool.max_size,
            cache = cache.is_some(),
            audit = audit.is_some(),
            "dispatcher ready"
        );

        Ok(Dispatcher {
            quota,
            request_limiter,
            error_limiter,
            cache,
            pool,
            audit,
            default_check_timeout: self.default_check_timeout,
            tasks: std::sync::Mutex::new(tasks),
        })
    }
}

impl Default for SkaldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(
    pool: &PoolConfig,
    request: &LimiterConfig,
    error: &LimiterConfig,
    check_timeout: Duration,
) -> Result<()> {
    if pool.max_size == 0 {
        return Err(SkaldError::Configuration("pool max_size must be at least 1".into()));
    }
    if pool.sweep_interval.is_zero() {
        return Err(SkaldError::Configuration("pool sweep_interval must be non-zero".into()));
    }
    for (name, limits) in [("request", request), ("error", error)] {
        if limits.window.is_zero() {
            return Err(SkaldError::Configuration(format!(
                "{name} limiter window must be non-zero"
            )));
        }
    }
    if check_timeout.is_zero() {
        return Err(SkaldError::Configuration("check timeout must be non-zero".into()));
    }
    Ok(())
}
