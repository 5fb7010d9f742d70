//! Sliding-window admission control keyed by caller identity.
//!
//! Two limiters share the same per-identity state machinery:
//!
//! - [`RequestLimiter`] gates every request: at most N events (and
//!   optionally B bytes) per identity inside a trailing window.
//! - [`ErrorRequestLimiter`] only counts error signals reported by the
//!   caller, and answers whether an identity has produced too many.
//!
//! Identity state lives in a bounded moka map with `time_to_idle` equal to
//! the window: an identity idle for a whole window has nothing left to
//! count, so evicting it loses nothing. The capacity bound keeps memory flat
//! under a flood of distinct identities. Each identity's events sit behind
//! their own mutex, so callers with different identities never contend.

mod error_limiter;
mod request;

pub use error_limiter::ErrorRequestLimiter;
pub use request::RequestLimiter;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Configuration for one limiter.
///
/// ```rust
/// # use skald::LimiterConfig;
/// # use std::time::Duration;
/// let config = LimiterConfig::new(20, Duration::from_secs(60))
///     .max_bytes(200_000)
///     .max_identities(50_000);
/// ```
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Events allowed per identity per window. Default: 60.
    pub max_events: usize,
    /// Length of the trailing window. Default: 60 seconds.
    pub window: Duration,
    /// Optional cap on summed request bytes per window (request limiter only).
    pub max_bytes: Option<u64>,
    /// Identities tracked at once. Default: 100,000.
    pub max_identities: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_events: 60,
            window: Duration::from_secs(60),
            max_bytes: None,
            max_identities: 100_000,
        }
    }
}

impl LimiterConfig {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            ..Self::default()
        }
    }

    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    pub fn max_identities(mut self, n: u64) -> Self {
        self.max_identities = n;
        self
    }
}

/// Timestamped events for one identity.
#[derive(Debug, Default)]
pub(crate) struct RateWindow {
    events: VecDeque<(Instant, u64)>,
    bytes: u64,
}

impl RateWindow {
    /// Drop events that left the window ending at `now`.
    pub(crate) fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, bytes)) = self.events.front() {
            if now.duration_since(at) < window {
                break;
            }
            self.events.pop_front();
            self.bytes -= bytes;
        }
    }

    pub(crate) fn record(&mut self, now: Instant, bytes: u64) {
        self.events.push_back((now, bytes));
        self.bytes += bytes;
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Time until only `allowed` events remain in the window.
    pub(crate) fn retry_after(&self, now: Instant, window: Duration, allowed: usize) -> Option<Duration> {
        let excess = self.events.len().checked_sub(allowed).filter(|&n| n > 0)?;
        let (at, _) = self.events.get(excess - 1)?;
        Some((*at + window).saturating_duration_since(now))
    }
}

/// Bounded, idle-evicted map of identity → window.
pub(crate) struct IdentityWindows {
    windows: moka::sync::Cache<String, Arc<Mutex<RateWindow>>>,
}

impl IdentityWindows {
    pub(crate) fn new(config: &LimiterConfig) -> Self {
        let windows = moka::sync::Cache::builder()
            .max_capacity(config.max_identities)
            .time_to_idle(config.window)
            .build();
        Self { windows }
    }

    /// Window for `identity`, created empty if absent.
    pub(crate) fn entry(&self, identity: &str) -> Arc<Mutex<RateWindow>> {
        self.windows
            .get_with_by_ref(identity, || Arc::new(Mutex::new(RateWindow::default())))
    }

    /// Window for `identity` without creating one.
    pub(crate) fn peek(&self, identity: &str) -> Option<Arc<Mutex<RateWindow>>> {
        self.windows.get(identity)
    }

    pub(crate) fn len(&self) -> u64 {
        self.windows.run_pending_tasks();
        self.windows.entry_count()
    }

    /// Apply pending evictions (idle identities, capacity overflow).
    pub(crate) fn sweep(&self) {
        self.windows.run_pending_tasks();
    }
}

pub(crate) fn lock(window: &Mutex<RateWindow>) -> MutexGuard<'_, RateWindow> {
    window.lock().unwrap_or_else(PoisonError::into_inner)
}
