//! Asynchronous, batched audit logging.
//!
//! Request handlers call [`AuditLogger::enqueue`], which never waits: the
//! record goes into a bounded queue, or is dropped (and counted) when the
//! queue is full. A single writer task drains the queue and commits
//! batches to an [`AuditSink`].
//!
//! # Commit triggers
//!
//! A batch is committed when either
//!
//! - it reaches `batch_size` records, or
//! - `max_flush_interval` has passed since the last commit,
//!
//! whichever comes first. A failed commit is retried with exponential
//! backoff on the writer task only; once `retry.max_attempts` is used up
//! the batch is dropped, counted, and logged. Producers keep enqueueing
//! while the writer retries; if that fills the queue, new records are
//! dropped rather than delaying requests.
//!
//! # Shutdown
//!
//! [`AuditLogger::shutdown`] stops intake, commits whatever is queued and
//! waits for the writer to exit.

mod retry;
mod sink;

pub use retry::RetryConfig;
pub use sink::{AuditSink, JsonLinesSink};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::telemetry;
use crate::types::{LimitsSource, RuleMatch, UserLimits};

/// Coarse caller class recorded in the audit log. Never the identity
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityClass {
    Anonymous,
    Account,
    Premium,
}

impl From<&UserLimits> for IdentityClass {
    fn from(limits: &UserLimits) -> Self {
        if limits.is_premium() {
            IdentityClass::Premium
        } else if limits.source() == LimitsSource::Anonymous {
            IdentityClass::Anonymous
        } else {
            IdentityClass::Account
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Checked,
    CacheHit,
    Failed { error: String },
}

/// One check or error event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Milliseconds since the unix epoch.
    pub timestamp_ms: u64,
    pub identity: IdentityClass,
    pub language: String,
    /// Characters submitted.
    pub text_length: usize,
    pub duration_ms: u64,
    /// Matches per rule id.
    pub rule_match_counts: BTreeMap<String, u32>,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn new(identity: IdentityClass, language: impl Into<String>, text_length: usize) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            timestamp_ms,
            identity,
            language: language.into(),
            text_length,
            duration_ms: 0,
            rule_match_counts: BTreeMap::new(),
            outcome: AuditOutcome::Checked,
        }
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn matches(mut self, matches: &[RuleMatch]) -> Self {
        for m in matches {
            *self.rule_match_counts.entry(m.rule_id.clone()).or_default() += 1;
        }
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Configuration for the audit logger.
///
/// ```rust
/// # use skald::AuditConfig;
/// # use std::time::Duration;
/// let config = AuditConfig::new()
///     .batch_size(100)
///     .max_flush_interval(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Records per committed batch. Default: 50.
    pub batch_size: usize,
    /// Longest time between commits while records are pending. Default: 10s.
    pub max_flush_interval: Duration,
    /// Records the queue holds before dropping. Default: 10,000.
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_flush_interval: Duration::from_secs(10),
            queue_capacity: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl AuditConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn max_flush_interval(mut self, interval: Duration) -> Self {
        self.max_flush_interval = interval;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Audit logger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub enqueued: u64,
    /// Rejected at enqueue because the queue was full or closed.
    pub dropped_queue_full: u64,
    pub written: u64,
    /// Lost because their batch failed every retry.
    pub dropped_write_failed: u64,
    pub failed_batches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped_queue_full: AtomicU64,
    written: AtomicU64,
    dropped_write_failed: AtomicU64,
    failed_batches: AtomicU64,
}

/// Handle to the audit queue and its writer task.
pub struct AuditLogger {
    tx: mpsc::Sender<AuditRecord>,
    counters: Arc<Counters>,
    shutdown: Arc<Notify>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Start the writer task. Requires a tokio runtime context.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: AuditConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(Notify::new());
        let writer = Writer {
            sink,
            batch_size: config.batch_size.max(1),
            max_flush_interval: config.max_flush_interval,
            retry: config.retry,
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(writer.run(rx, Arc::clone(&shutdown)));
        Self {
            tx,
            counters,
            shutdown,
            writer: Mutex::new(Some(handle)),
        }
    }

    /// Queue a record without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, record: AuditRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "queue_full",
                    TrySendError::Closed(_) => "closed",
                };
                self.counters
                    .dropped_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::AUDIT_DROPPED_TOTAL, "reason" => reason).increment(1);
                debug!(reason, "audit record dropped");
                false
            }
        }
    }

    pub fn stats(&self) -> AuditStats {
        let c = &self.counters;
        AuditStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped_queue_full: c.dropped_queue_full.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            dropped_write_failed: c.dropped_write_failed.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Commit everything queued and stop the writer. Later enqueues are
    /// dropped. Safe to call more than once.
    pub async fn shutdown(&self) {
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(e) = handle.await {
            error!(error = %e, "audit writer task failed");
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct Writer {
    sink: Arc<dyn AuditSink>,
    batch_size: usize,
    max_flush_interval: Duration,
    retry: RetryConfig,
    counters: Arc<Counters>,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<AuditRecord>, shutdown: Arc<Notify>) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut last_commit = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    rx.close();
                    while let Some(record) = rx.recv().await {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.commit(&mut batch).await;
                        }
                    }
                    self.commit(&mut batch).await;
                    break;
                }
                received = rx.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.commit(&mut batch).await;
                            last_commit = Instant::now();
                        }
                    }
                    None => {
                        self.commit(&mut batch).await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(last_commit + self.max_flush_interval) => {
                    self.commit(&mut batch).await;
                    last_commit = Instant::now();
                }
            }
        }
        info!("audit writer stopped");
    }

    async fn commit(&self, batch: &mut Vec<AuditRecord>) {
        if batch.is_empty() {
            return;
        }
        let records = std::mem::take(batch);
        let n = records.len() as u64;
        match retry::with_retry(&self.retry, "audit.write_batch", || {
            self.sink.write_batch(&records)
        })
        .await
        {
            Ok(()) => {
                self.counters.written.fetch_add(n, Ordering::Relaxed);
                metrics::counter!(telemetry::AUDIT_BATCHES_TOTAL).increment(1);
                debug!(records = n, "audit batch committed");
            }
            Err(e) => {
                self.counters
                    .dropped_write_failed
                    .fetch_add(n, Ordering::Relaxed);
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::AUDIT_DROPPED_TOTAL, "reason" => "write_failed")
                    .increment(n);
                error!(records = n, error = %e, "audit batch dropped after retries");
            }
        }
    }
}
