use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{IdentityWindows, LimiterConfig, lock};
use crate::telemetry;
use crate::{Result, SkaldError};

/// Counts error signals per identity.
///
/// Unlike [`RequestLimiter`](super::RequestLimiter) this does not see every
/// request. The dispatcher reports failures with
/// [`log_access`](Self::log_access) and consults
/// [`would_access_be_okay`](Self::would_access_be_okay) before serving the
/// next request from the same identity.
pub struct ErrorRequestLimiter {
    config: LimiterConfig,
    windows: IdentityWindows,
}

impl ErrorRequestLimiter {
    pub fn new(max_errors: usize, window: Duration) -> Self {
        Self::with_config(LimiterConfig::new(max_errors, window))
    }

    pub fn with_config(config: LimiterConfig) -> Self {
        let windows = IdentityWindows::new(&config);
        Self { config, windows }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Record one error event for `identity`.
    pub fn log_access(&self, identity: &str) {
        let now = Instant::now();
        let entry = self.windows.entry(identity);
        let mut events = lock(&entry);
        events.prune(now, self.config.window);
        events.record(now, 0);
    }

    /// `false` once `identity` has more than `max_events` errors in the
    /// window. Does not record anything.
    pub fn would_access_be_okay(&self, identity: &str) -> bool {
        self.check(identity).is_ok()
    }

    /// Like [`would_access_be_okay`](Self::would_access_be_okay), reporting
    /// when the identity will be let back in.
    pub fn check(&self, identity: &str) -> Result<()> {
        let Some(entry) = self.windows.peek(identity) else {
            return Ok(());
        };
        let now = Instant::now();
        let mut events = lock(&entry);
        events.prune(now, self.config.window);
        if events.len() <= self.config.max_events {
            return Ok(());
        }
        let retry_after = events.retry_after(now, self.config.window, self.config.max_events);
        drop(events);
        debug!(identity, ?retry_after, "error limit reached");
        metrics::counter!(telemetry::RATE_LIMITED_TOTAL, "limiter" => "error").increment(1);
        Err(SkaldError::TooManyErrors { retry_after })
    }

    pub fn tracked_identities(&self) -> u64 {
        self.windows.len()
    }

    pub fn sweep(&self) {
        self.windows.sweep();
    }
}

impl std::fmt::Debug for ErrorRequestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRequestLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
