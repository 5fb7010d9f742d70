//! Per-request orchestration.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::audit::{AuditLogger, AuditOutcome, AuditRecord, AuditStats, IdentityClass};
use crate::cache::{Fingerprint, ResultCache};
use crate::limiter::{ErrorRequestLimiter, RequestLimiter};
use crate::pool::PipelinePool;
use crate::quota::QuotaResolver;
use crate::telemetry;
use crate::types::{
    CallerIdentity, CheckResponse, CheckResult, HandledResponse, RequestContext, UserLimits,
};
use crate::{Result, SkaldError};

/// Serves check requests.
///
/// Built with [`Skald::builder()`](crate::Skald::builder). Owns the pool,
/// cache, limiters and audit logger for its lifetime; call
/// [`shutdown`](Self::shutdown) to stop background tasks and flush the
/// audit log.
///
/// Per request:
///
/// 1. resolve the caller's [`UserLimits`];
/// 2. reject callers over the error budget, then (unless premium) apply
///    the request limiter;
/// 3. validate the request and probe the result cache;
/// 4. check out a pipeline and run the engine on the blocking pool, under
///    a hard timeout;
/// 5. cache the result and enqueue an audit record.
pub struct Dispatcher {
    pub(super) quota: QuotaResolver,
    pub(super) request_limiter: Arc<RequestLimiter>,
    pub(super) error_limiter: Arc<ErrorRequestLimiter>,
    pub(super) cache: Option<ResultCache>,
    pub(super) pool: PipelinePool,
    pub(super) audit: Option<AuditLogger>,
    pub(super) default_check_timeout: Duration,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Check `request` and return its matches.
    #[instrument(name = "dispatch.check", skip_all, fields(language = %request.language))]
    pub async fn check(&self, request: RequestContext) -> Result<CheckResponse> {
        let started = Instant::now();

        let limits = match self.quota.resolve(&request.caller, request.strict_auth).await {
            Ok(limits) => limits,
            Err(e) => {
                record_request(e.kind(), started);
                return Err(e);
            }
        };
        let identity = identity_key(&request.caller, &limits);
        let text = request.text.to_plain();

        if let Err(e) = self.admit(&identity, &limits, text.len() as u64) {
            record_request(e.kind(), started);
            return Err(e);
        }

        let result = self.run(&request, &limits, &identity, &text).await;

        let status = match &result {
            Ok(response) if response.cached => "cached",
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        record_request(status, started);
        self.record_audit(&request.language, &limits, &text, started.elapsed(), &result);
        result
    }

    /// Check `request` and turn the outcome into a status code and JSON body.
    pub async fn handle(&self, request: RequestContext) -> HandledResponse {
        match self.check(request).await {
            Ok(response) => match serde_json::to_value(&response) {
                Ok(body) => HandledResponse { status: 200, body },
                Err(e) => HandledResponse::from(&SkaldError::Json(e)),
            },
            Err(e) => HandledResponse::from(&e),
        }
    }

    fn admit(&self, identity: &str, limits: &UserLimits, bytes: u64) -> Result<()> {
        self.error_limiter.check(identity)?;
        if limits.is_premium() {
            return Ok(());
        }
        self.request_limiter
            .check_with_limit(identity, bytes, limits.request_quota())
    }

    async fn run(
        &self,
        request: &RequestContext,
        limits: &UserLimits,
        identity: &str,
        text: &str,
    ) -> Result<CheckResponse> {
        if request.language.trim().is_empty() {
            return Err(SkaldError::InvalidRequest("language must not be empty".into()));
        }
        let length = text.chars().count();
        if length > limits.max_text_length() {
            return Err(SkaldError::TextTooLong {
                length,
                limit: limits.max_text_length(),
            });
        }

        let key = request.pipeline_key();
        let fingerprint = Fingerprint::compute(text, &key);
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&fingerprint).await
        {
            return Ok(CheckResponse::from_result(hit, true));
        }

        let mut lease = self.pool.acquire(&key).await?;
        let limit = self.check_timeout(limits, request.deadline_ms);
        let cancel = lease.cancellation().clone();
        let owned = text.to_string();
        let engine_started = Instant::now();

        // The lease moves into the blocking task and is dropped there, so
        // a pipeline outliving the timeout is discarded only once the
        // engine actually lets go of it.
        let task = tokio::task::spawn_blocking(move || lease.run_check(&owned));
        let matches = match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SkaldError::Engine(format!("check task failed: {e}"))),
            Err(_) => {
                cancel.cancel();
                warn!(identity, limit_ms = limit.as_millis() as u64, "check timed out");
                self.error_limiter.log_access(identity);
                return Err(SkaldError::CheckTimeout { limit });
            }
        };
        let matches = matches.inspect_err(|e| {
            warn!(identity, error = %e, "engine failed");
            self.error_limiter.log_access(identity);
        })?;
        metrics::histogram!(telemetry::CHECK_DURATION_SECONDS,
            "language" => request.language.clone(),
        )
        .record(engine_started.elapsed().as_secs_f64());

        let result = CheckResult {
            language: request.language.clone(),
            matches,
        };
        if let Some(cache) = &self.cache {
            cache.put(fingerprint, result.clone()).await;
        }
        Ok(CheckResponse::from_result(result, false))
    }

    fn check_timeout(&self, limits: &UserLimits, deadline_ms: Option<u64>) -> Duration {
        let limit = limits
            .max_check_duration()
            .unwrap_or(self.default_check_timeout);
        match deadline_ms {
            Some(ms) => limit.min(Duration::from_millis(ms)),
            None => limit,
        }
    }

    fn record_audit(
        &self,
        language: &str,
        limits: &UserLimits,
        text: &str,
        elapsed: Duration,
        result: &Result<CheckResponse>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let record = AuditRecord::new(IdentityClass::from(limits), language, text.chars().count())
            .duration(elapsed);
        let record = match result {
            Ok(response) if response.cached => record
                .matches(&response.matches)
                .outcome(AuditOutcome::CacheHit),
            Ok(response) => record.matches(&response.matches),
            Err(e) => record.outcome(AuditOutcome::Failed {
                error: e.kind().to_string(),
            }),
        };
        audit.enqueue(record);
    }

    pub fn pool(&self) -> &PipelinePool {
        &self.pool
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    pub fn request_limiter(&self) -> &RequestLimiter {
        &self.request_limiter
    }

    pub fn error_limiter(&self) -> &ErrorRequestLimiter {
        &self.error_limiter
    }

    pub fn quota(&self) -> &QuotaResolver {
        &self.quota
    }

    pub fn audit_stats(&self) -> Option<AuditStats> {
        self.audit.as_ref().map(AuditLogger::stats)
    }

    /// Stop background sweeps and flush the audit log.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        if let Some(audit) = &self.audit {
            audit.shutdown().await;
        }
        debug!("dispatcher shut down");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("cache", &self.cache.is_some())
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

/// Key the limiters use for a caller: the account when known, else the IP.
fn identity_key(caller: &CallerIdentity, limits: &UserLimits) -> String {
    if let Some(account) = limits.account_id() {
        format!("account:{account}")
    } else if let Some(ip) = caller.ip.as_deref() {
        format!("ip:{ip}")
    } else {
        "anonymous".to_string()
    }
}

fn record_request(status: &'static str, started: Instant) {
    metrics::counter!(telemetry::REQUESTS_TOTAL, "status" => status).increment(1);
    debug!(
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request finished"
    );
}

/// Periodically evict idle limiter identities. Stops once both limiters
/// are dropped.
pub(super) fn spawn_limiter_sweeper(
    request: &Arc<RequestLimiter>,
    error: &Arc<ErrorRequestLimiter>,
    interval: Duration,
) -> JoinHandle<()> {
    let request = Arc::downgrade(request);
    let error = Arc::downgrade(error);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (Some(request), Some(error)) = (request.upgrade(), error.upgrade()) else {
                break;
            };
            request.sweep();
            error.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LimitsSource;

    #[test]
    fn identity_prefers_account_over_ip() {
        let caller = CallerIdentity::ip("10.0.0.1");
        let anon = UserLimits::new(10, None);
        let account = UserLimits::new(10, None)
            .with_account("a1")
            .with_source(LimitsSource::Token);
        assert_eq!(identity_key(&caller, &anon), "ip:10.0.0.1");
        assert_eq!(identity_key(&caller, &account), "account:a1");
        assert_eq!(identity_key(&CallerIdentity::default(), &anon), "anonymous");
    }
}
