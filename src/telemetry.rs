//! Telemetry metric name constants.
//!
//! Centralised metric names for skald operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `skald_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `status`: request outcome, "ok", "cached" or an error kind
//! - `language`: language code of the checked text
//! - `limiter`: "request" or "error"

/// Total check requests handled by the dispatcher.
///
/// Labels: `status`.
pub const REQUESTS_TOTAL: &str = "skald_requests_total";

/// Time spent inside the analysis engine, in seconds.
///
/// Labels: `language`.
pub const CHECK_DURATION_SECONDS: &str = "skald_check_duration_seconds";

/// Total result cache hits.
pub const CACHE_HITS_TOTAL: &str = "skald_cache_hits_total";

/// Total result cache misses.
pub const CACHE_MISSES_TOTAL: &str = "skald_cache_misses_total";

/// Total requests rejected by a rate limiter.
///
/// Labels: `limiter`.
pub const RATE_LIMITED_TOTAL: &str = "skald_rate_limited_total";

/// Total pipelines built by the pool.
pub const PIPELINES_CREATED_TOTAL: &str = "skald_pipelines_created_total";

/// Total pipelines dropped by the pool (expiry, over capacity, timeout).
///
/// Labels: `reason` ("expired" | "over_capacity" | "cancelled").
pub const PIPELINES_DISCARDED_TOTAL: &str = "skald_pipelines_discarded_total";

/// Live pipelines (idle + in use).
pub const POOL_LIVE_PIPELINES: &str = "skald_pool_live_pipelines";

/// Total audit records dropped because the queue was full or the sink
/// kept failing.
///
/// Labels: `reason` ("queue_full" | "write_failed").
pub const AUDIT_DROPPED_TOTAL: &str = "skald_audit_dropped_total";

/// Total audit batches committed to the sink.
pub const AUDIT_BATCHES_TOTAL: &str = "skald_audit_batches_total";

/// Total failed audit batch writes (each retry attempt counts).
pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "skald_audit_write_failures_total";
