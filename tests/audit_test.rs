//! Tests for [`AuditLogger`]: batching, flushing, retry, back-pressure.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use skald::{
    AuditConfig, AuditLogger, AuditOutcome, AuditRecord, AuditSink, IdentityClass, JsonLinesSink,
    Result, RetryConfig, RuleMatch, SkaldError,
};

// ============================================================================
// Mock sinks
// ============================================================================

/// Keeps every committed batch in memory.
#[derive(Default)]
struct MemorySink {
    batches: Mutex<Vec<Vec<AuditRecord>>>,
}

impl MemorySink {
    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<()> {
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

/// Fails the first `failures` writes, then succeeds.
struct FlakySink {
    failures: u32,
    calls: AtomicU32,
    inner: MemorySink,
}

impl FlakySink {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            inner: MemorySink::default(),
        }
    }
}

#[async_trait]
impl AuditSink for FlakySink {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(SkaldError::AuditWriteFailure("disk unavailable".into()));
        }
        self.inner.write_batch(records).await
    }
}

/// Blocks its first write until released.
#[derive(Default)]
struct GatedSink {
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
    inner: MemorySink,
}

#[async_trait]
impl AuditSink for GatedSink {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<()> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.write_batch(records).await
    }
}

fn record(language: &str) -> AuditRecord {
    AuditRecord::new(IdentityClass::Anonymous, language, 42)
}

fn quiet_config() -> AuditConfig {
    AuditConfig::new()
        .batch_size(100)
        .max_flush_interval(Duration::from_secs(3600))
}

// ============================================================================
// Commit triggers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn full_batch_is_committed_immediately() {
    let sink = Arc::new(MemorySink::default());
    let logger = AuditLogger::spawn(sink.clone(), quiet_config().batch_size(3));

    for _ in 0..7 {
        assert!(logger.enqueue(record("en")));
    }
    // Let the writer drain the queue; the interval is far away.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.batch_sizes(), vec![3, 3]);

    logger.shutdown().await;
    assert_eq!(sink.batch_sizes(), vec![3, 3, 1]);
}

#[tokio::test(start_paused = true)]
async fn partial_batch_is_committed_after_interval() {
    let sink = Arc::new(MemorySink::default());
    let logger = AuditLogger::spawn(
        sink.clone(),
        AuditConfig::new()
            .batch_size(100)
            .max_flush_interval(Duration::from_secs(10)),
    );

    logger.enqueue(record("en"));
    logger.enqueue(record("de"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(sink.batch_sizes().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(sink.batch_sizes(), vec![2]);
    assert_eq!(logger.stats().written, 2);
}

#[tokio::test]
async fn shutdown_flushes_pending_records() {
    let sink = Arc::new(MemorySink::default());
    let logger = AuditLogger::spawn(sink.clone(), quiet_config());

    for _ in 0..5 {
        logger.enqueue(record("en"));
    }
    logger.shutdown().await;

    assert_eq!(sink.batch_sizes(), vec![5]);
    let stats = logger.stats();
    assert_eq!(stats.enqueued, 5);
    assert_eq!(stats.written, 5);
}

#[tokio::test]
async fn enqueue_after_shutdown_is_dropped() {
    let sink = Arc::new(MemorySink::default());
    let logger = AuditLogger::spawn(sink, quiet_config());
    logger.shutdown().await;
    // Second shutdown is a no-op.
    logger.shutdown().await;

    assert!(!logger.enqueue(record("en")));
    assert_eq!(logger.stats().dropped_queue_full, 1);
}

// ============================================================================
// Back-pressure
// ============================================================================

#[tokio::test]
async fn full_queue_drops_instead_of_blocking() {
    let sink = Arc::new(GatedSink::default());
    let logger = AuditLogger::spawn(
        sink.clone(),
        quiet_config().batch_size(1).queue_capacity(2),
    );

    // The writer takes the first record and blocks in the sink.
    assert!(logger.enqueue(record("en")));
    sink.entered.notified().await;

    assert!(logger.enqueue(record("en")));
    assert!(logger.enqueue(record("en")));
    assert!(!logger.enqueue(record("en")));
    assert_eq!(logger.stats().dropped_queue_full, 1);

    sink.release.notify_one();
    logger.shutdown().await;

    let stats = logger.stats();
    assert_eq!(stats.written, 3);
    assert_eq!(stats.enqueued, 3);
    assert_eq!(sink.inner.batch_sizes(), vec![1, 1, 1]);
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_write_is_retried() {
    let sink = Arc::new(FlakySink::new(2));
    let logger = AuditLogger::spawn(
        sink.clone(),
        quiet_config().retry(
            RetryConfig::new()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(100)),
        ),
    );

    logger.enqueue(record("en"));
    logger.shutdown().await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    let stats = logger.stats();
    assert_eq!(stats.written, 1);
    assert_eq!(stats.failed_batches, 0);
}

#[tokio::test(start_paused = true)]
async fn batch_is_dropped_after_retries_run_out() {
    let sink = Arc::new(FlakySink::new(u32::MAX));
    let logger = AuditLogger::spawn(
        sink.clone(),
        quiet_config().retry(
            RetryConfig::new()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(100)),
        ),
    );

    logger.enqueue(record("en"));
    logger.enqueue(record("de"));
    logger.shutdown().await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    let stats = logger.stats();
    assert_eq!(stats.written, 0);
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.dropped_write_failed, 2);
}

// ============================================================================
// JsonLinesSink
// ============================================================================

#[tokio::test]
async fn json_lines_sink_appends_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("audit.jsonl");
    let sink = JsonLinesSink::new(&path);

    let checked = record("en").matches(&[
        RuleMatch::new("WORD_REPEAT_RULE", "Repeated word", 5, 5),
        RuleMatch::new("WORD_REPEAT_RULE", "Repeated word", 15, 3),
    ]);
    let failed = record("de").outcome(AuditOutcome::Failed {
        error: "check_timeout".into(),
    });
    sink.write_batch(std::slice::from_ref(&checked)).await.unwrap();
    sink.write_batch(std::slice::from_ref(&failed)).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<AuditRecord> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines, vec![checked, failed]);
    assert_eq!(lines[0].rule_match_counts.get("WORD_REPEAT_RULE"), Some(&2));
}

#[tokio::test]
async fn json_lines_sink_reports_unwritable_path() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be opened for appending.
    let sink = JsonLinesSink::new(dir.path());

    let err = sink.write_batch(&[record("en")]).await.unwrap_err();
    assert!(matches!(err, SkaldError::AuditWriteFailure(_)));
    assert!(err.is_transient());
}
