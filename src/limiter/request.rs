use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{IdentityWindows, LimiterConfig, lock};
use crate::telemetry;
use crate::{Result, SkaldError};

/// Admits up to `max_events` requests per identity in a sliding window.
///
/// Only admitted requests are recorded, so a rejected caller gets in again
/// as soon as its oldest admitted request ages out, however often it
/// retries in between.
pub struct RequestLimiter {
    config: LimiterConfig,
    windows: IdentityWindows,
}

impl RequestLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self::with_config(LimiterConfig::new(max_events, window))
    }

    pub fn with_config(config: LimiterConfig) -> Self {
        let windows = IdentityWindows::new(&config);
        Self { config, windows }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Record a request for `identity` if the window has room.
    pub fn is_access_okay(&self, identity: &str) -> bool {
        self.check(identity, 0).is_ok()
    }

    /// Like [`is_access_okay`](Self::is_access_okay), also charging `bytes`
    /// against the byte budget, and reporting when to retry.
    pub fn check(&self, identity: &str, bytes: u64) -> Result<()> {
        self.check_with_limit(identity, bytes, None)
    }

    /// Admission with a per-caller event limit overriding the configured one.
    pub fn check_with_limit(&self, identity: &str, bytes: u64, limit: Option<usize>) -> Result<()> {
        let max_events = limit.unwrap_or(self.config.max_events);
        let window = self.config.window;
        let now = Instant::now();

        let entry = self.windows.entry(identity);
        let mut events = lock(&entry);
        events.prune(now, window);

        let retry_after = if events.len() >= max_events {
            Some(events.retry_after(now, window, max_events.saturating_sub(1)))
        } else if self
            .config
            .max_bytes
            .is_some_and(|max| events.bytes() + bytes > max)
        {
            Some(events.retry_after(now, window, events.len().saturating_sub(1)))
        } else {
            None
        };

        if let Some(retry_after) = retry_after {
            drop(events);
            debug!(identity, ?retry_after, "request limit reached");
            metrics::counter!(telemetry::RATE_LIMITED_TOTAL, "limiter" => "request").increment(1);
            return Err(SkaldError::RateLimitExceeded { retry_after });
        }

        events.record(now, bytes);
        Ok(())
    }

    /// Identities currently holding a window.
    pub fn tracked_identities(&self) -> u64 {
        self.windows.len()
    }

    /// Evict idle identities now instead of lazily.
    pub fn sweep(&self) {
        self.windows.sweep();
    }
}

impl std::fmt::Debug for RequestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn per_caller_limit_overrides_configured_limit() {
        let limiter = RequestLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check_with_limit("acct", 0, Some(3)).is_ok());
        assert!(limiter.check_with_limit("acct", 0, Some(3)).is_ok());
        assert!(limiter.check_with_limit("acct", 0, Some(3)).is_ok());
        assert!(limiter.check_with_limit("acct", 0, Some(3)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn byte_budget_rejects_before_event_limit() {
        let limiter =
            RequestLimiter::with_config(LimiterConfig::new(100, Duration::from_secs(10)).max_bytes(1_000));
        limiter.check("ip", 600).unwrap();
        let err = limiter.check("ip", 600).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));
        assert!(limiter.check("ip", 400).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_counts_down_with_time() {
        let limiter = RequestLimiter::new(1, Duration::from_secs(10));
        limiter.check("ip", 0).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        let err = limiter.check("ip", 0).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(6)));
    }
}
