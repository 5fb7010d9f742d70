//! Keyed pool of analysis pipelines.
//!
//! Pipelines are expensive to build and unsafe to share, so the pool keeps
//! idle ones per [`PipelineKey`] and hands each out to exactly one caller at
//! a time through a [`PipelineLease`].
//!
//! # Accounting
//!
//! One mutex guards both the idle map and the live count (idle + in use).
//! The capacity check and the slot reservation happen in the same critical
//! section, so concurrent acquires can never push the live count past
//! `max_size`. Building happens outside the lock, on the blocking pool; a
//! failed build gives its slot back.
//!
//! ```text
//! acquire(key)
//!     │
//!     ├── idle pipeline for key? ──────────► lease it
//!     ├── live < max? ── reserve slot ─────► build, seal, lease it
//!     ├── idle pipeline for other key? ────► evict oldest, reuse slot, build
//!     └── otherwise ───────────────────────► PoolExhausted
//!
//! drop(lease)
//!     ├── cancelled / panicking ───────────► discard (live -= 1)
//!     ├── live > max (max lowered) ────────► discard (live -= 1)
//!     └── otherwise ───────────────────────► idle, stamped with now
//! ```
//!
//! Idle pipelines older than `idle_expiry` are removed by
//! [`PipelinePool::sweep_expired`], which a single background task started
//! with [`PipelinePool::spawn_sweeper`] calls periodically. In-use
//! pipelines are never in the idle map, so the sweep cannot touch them.

mod lease;
mod pipeline;

pub use lease::PipelineLease;
pub use pipeline::Pipeline;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::PipelineEngine;
use crate::telemetry;
use crate::types::PipelineKey;
use crate::{Result, SkaldError};

/// Configuration for the pipeline pool.
///
/// ```rust
/// # use skald::PoolConfig;
/// # use std::time::Duration;
/// let config = PoolConfig::new()
///     .max_size(16)
///     .idle_expiry(Duration::from_secs(300));
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live pipelines across all keys. Default: 32.
    pub max_size: usize,
    /// Idle pipelines older than this are evicted. Default: 10 minutes.
    pub idle_expiry: Duration,
    /// How often the background sweep runs. Default: 30 seconds.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 32,
            idle_expiry: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn idle_expiry(mut self, expiry: Duration) -> Self {
        self.idle_expiry = expiry;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
    /// Pipelines built since the pool was created.
    pub created: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum DiscardReason {
    Expired,
    OverCapacity,
    Cancelled,
}

impl DiscardReason {
    fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Expired => "expired",
            DiscardReason::OverCapacity => "over_capacity",
            DiscardReason::Cancelled => "cancelled",
        }
    }
}

struct IdlePipeline {
    pipeline: Pipeline,
    released_at: Instant,
}

struct PoolState {
    idle: HashMap<PipelineKey, Vec<IdlePipeline>>,
    live: usize,
    max_size: usize,
}

impl PoolState {
    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    fn take_idle(&mut self, key: &PipelineKey) -> Option<Pipeline> {
        let list = self.idle.get_mut(key)?;
        // Most recently released first, so cold pipelines age out.
        let taken = list.pop();
        if list.is_empty() {
            self.idle.remove(key);
        }
        taken.map(|idle| idle.pipeline)
    }

    /// Remove the idle pipeline that has waited longest, across all keys.
    /// The live count is left to the caller.
    fn take_oldest_idle(&mut self) -> Option<Pipeline> {
        let (key, index) = self
            .idle
            .iter()
            .flat_map(|(key, list)| {
                list.iter()
                    .enumerate()
                    .map(move |(i, idle)| (key, i, idle.released_at))
            })
            .min_by_key(|(_, _, released_at)| *released_at)
            .map(|(key, i, _)| (key.clone(), i))?;
        let list = self.idle.get_mut(&key)?;
        let idle = list.remove(index);
        if list.is_empty() {
            self.idle.remove(&key);
        }
        Some(idle.pipeline)
    }
}

enum Checkout {
    Reused(Pipeline),
    /// A slot was reserved; `evicted` made room for it.
    Reserved { evicted: Option<Pipeline> },
}

pub(crate) struct PoolShared {
    engine: Arc<dyn PipelineEngine>,
    state: Mutex<PoolState>,
    idle_expiry: Duration,
    next_id: AtomicU64,
    created: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section leaves the state consistent before any
        // call that could panic, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(&self, key: &PipelineKey) -> Result<Checkout> {
        let mut state = self.lock();
        if let Some(pipeline) = state.take_idle(key) {
            return Ok(Checkout::Reused(pipeline));
        }
        if state.live < state.max_size {
            state.live += 1;
            record_live(state.live);
            return Ok(Checkout::Reserved { evicted: None });
        }
        // Full, but some other key may be hogging idle slots.
        match state.take_oldest_idle() {
            Some(victim) => Ok(Checkout::Reserved {
                evicted: Some(victim),
            }),
            None => Err(SkaldError::PoolExhausted),
        }
    }

    fn unreserve(&self) {
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        record_live(state.live);
    }

    fn create_pipeline(&self, key: &PipelineKey) -> Result<Pipeline> {
        let handle = self.engine.build_pipeline(key).map_err(|e| match e {
            SkaldError::PipelineCreationFailed(_) => e,
            other => SkaldError::PipelineCreationFailed(other.to_string()),
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pipeline = Pipeline::new(id, key.clone(), handle);
        pipeline.configure_from_key()?;
        pipeline.seal();
        self.created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::PIPELINES_CREATED_TOTAL).increment(1);
        Ok(pipeline)
    }

    pub(crate) fn give_back(&self, pipeline: Pipeline) {
        let mut state = self.lock();
        if state.live > state.max_size {
            state.live -= 1;
            record_live(state.live);
            drop(state);
            debug!(pipeline = pipeline.id(), "pool over capacity, discarding");
            record_discard(DiscardReason::OverCapacity, 1);
            return;
        }
        let key = pipeline.key().clone();
        state.idle.entry(key).or_default().push(IdlePipeline {
            pipeline,
            released_at: Instant::now(),
        });
    }

    pub(crate) fn discard(&self, pipeline: Pipeline, reason: DiscardReason) {
        {
            let mut state = self.lock();
            state.live = state.live.saturating_sub(1);
            record_live(state.live);
        }
        debug!(pipeline = pipeline.id(), reason = reason.as_str(), "pipeline discarded");
        record_discard(reason, 1);
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut state = self.lock();
            state.idle.retain(|_, list| {
                let (stale, fresh): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|idle| now.duration_since(idle.released_at) >= self.idle_expiry);
                expired.extend(stale);
                *list = fresh;
                !list.is_empty()
            });
            state.live = state.live.saturating_sub(expired.len());
            record_live(state.live);
        }
        // Dropping an engine handle may be slow; do it outside the lock.
        let removed = expired.len();
        drop(expired);
        if removed > 0 {
            record_discard(DiscardReason::Expired, removed as u64);
        }
        removed
    }
}

fn record_live(live: usize) {
    metrics::gauge!(telemetry::POOL_LIVE_PIPELINES).set(live as f64);
}

fn record_discard(reason: DiscardReason, n: u64) {
    metrics::counter!(telemetry::PIPELINES_DISCARDED_TOTAL, "reason" => reason.as_str())
        .increment(n);
}

/// Releases a reserved slot unless the build succeeds. Lives inside the
/// blocking build, so the slot stays taken until the build has really
/// finished, even when the `acquire` future is dropped mid-build.
struct Reservation {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.shared.unreserve();
        }
    }
}

/// Keyed pool of sealed pipelines. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PipelinePool {
    shared: Arc<PoolShared>,
}

impl PipelinePool {
    /// Create an empty pool building pipelines with `engine`.
    pub fn new(engine: Arc<dyn PipelineEngine>, config: &PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                engine,
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    live: 0,
                    max_size: config.max_size,
                }),
                idle_expiry: config.idle_expiry,
                next_id: AtomicU64::new(0),
                created: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a pipeline for `key`, building one if none is idle.
    ///
    /// Fails with [`SkaldError::PoolExhausted`] when every slot is in use,
    /// or [`SkaldError::PipelineCreationFailed`] when the engine cannot
    /// build one. Neither failure changes the live count.
    pub async fn acquire(&self, key: &PipelineKey) -> Result<PipelineLease> {
        let evicted = match self.shared.checkout(key)? {
            Checkout::Reused(pipeline) => {
                debug!(pipeline = pipeline.id(), language = key.language(), "reusing pipeline");
                return Ok(PipelineLease::new(pipeline, Arc::clone(&self.shared)));
            }
            Checkout::Reserved { evicted } => evicted,
        };
        let mut reservation = Reservation {
            shared: Arc::clone(&self.shared),
            armed: true,
        };
        if let Some(victim) = evicted {
            debug!(pipeline = victim.id(), "evicting idle pipeline to make room");
            drop(victim);
            record_discard(DiscardReason::OverCapacity, 1);
        }

        let shared = Arc::clone(&self.shared);
        let build_key = key.clone();
        // A lease made on the blocking thread goes back to the idle set if
        // nobody is left to receive it.
        let built = tokio::task::spawn_blocking(move || -> Result<PipelineLease> {
            let pipeline = shared.create_pipeline(&build_key)?;
            reservation.armed = false;
            Ok(PipelineLease::new(pipeline, shared))
        })
        .await
        .unwrap_or_else(|e| Err(SkaldError::PipelineCreationFailed(e.to_string())));

        match built {
            Ok(lease) => {
                debug!(
                    pipeline = lease.id(),
                    language = key.language(),
                    engine = self.shared.engine.name(),
                    "built pipeline"
                );
                Ok(lease)
            }
            Err(e) => {
                warn!(language = key.language(), error = %e, "pipeline build failed");
                Err(e)
            }
        }
    }

    /// Return a leased pipeline. Equivalent to dropping the lease.
    pub fn release(&self, lease: PipelineLease) {
        drop(lease);
    }

    /// Build a sealed pipeline for `key` without registering it in the
    /// pool. Blocks; call from a blocking context.
    pub fn create_pipeline(&self, key: &PipelineKey) -> Result<Pipeline> {
        self.shared.create_pipeline(key)
    }

    /// Remove idle pipelines past the idle expiry. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let removed = self.shared.sweep_expired();
        if removed > 0 {
            info!(removed, "swept expired pipelines");
        }
        removed
    }

    /// Change the capacity. Idle pipelines are dropped right away to fit;
    /// in-use ones are discarded as they come back.
    pub fn set_max_size(&self, max_size: usize) {
        let mut trimmed = Vec::new();
        {
            let mut state = self.shared.lock();
            state.max_size = max_size;
            while state.live > state.max_size {
                match state.take_oldest_idle() {
                    Some(pipeline) => {
                        state.live -= 1;
                        trimmed.push(pipeline);
                    }
                    None => break,
                }
            }
            record_live(state.live);
        }
        if !trimmed.is_empty() {
            record_discard(DiscardReason::OverCapacity, trimmed.len() as u64);
        }
    }

    /// Build (or touch) one pipeline per key ahead of traffic.
    ///
    /// Returns the number of keys that now have a pipeline ready.
    pub async fn prewarm(&self, keys: &[PipelineKey]) -> Result<usize> {
        let mut warmed = 0;
        for key in keys {
            let lease = self.acquire(key).await?;
            drop(lease);
            warmed += 1;
        }
        info!(warmed, "pipeline pool prewarmed");
        Ok(warmed)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let idle = state.idle_count();
        PoolStats {
            live: state.live,
            idle,
            in_use: state.live.saturating_sub(idle),
            max_size: state.max_size,
            created: self.shared.created.load(Ordering::Relaxed),
        }
    }

    /// Start the periodic expiry sweep.
    ///
    /// The task holds only a weak reference and stops once every clone of
    /// the pool is gone. Requires a tokio runtime context.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let removed = shared.sweep_expired();
                if removed > 0 {
                    info!(removed, "swept expired pipelines");
                }
            }
        })
    }
}

impl std::fmt::Debug for PipelinePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinePool")
            .field("stats", &self.stats())
            .finish()
    }
}
