//! Tests for the sliding-window limiters.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use skald::{ErrorRequestLimiter, LimiterConfig, RequestLimiter, SkaldError};

// ============================================================================
// RequestLimiter
// ============================================================================

#[tokio::test(start_paused = true)]
async fn request_limiter_window() {
    let limiter = RequestLimiter::new(3, Duration::from_secs(2));

    assert!(limiter.is_access_okay("10.0.0.1"));
    assert!(limiter.is_access_okay("10.0.0.1"));
    assert!(limiter.is_access_okay("10.0.0.1"));
    assert!(!limiter.is_access_okay("10.0.0.1"));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(limiter.is_access_okay("10.0.0.1"));
}

#[tokio::test(start_paused = true)]
async fn request_limiter_slides_rather_than_resets() {
    let limiter = RequestLimiter::new(2, Duration::from_secs(10));

    assert!(limiter.is_access_okay("ip"));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(limiter.is_access_okay("ip"));
    assert!(!limiter.is_access_okay("ip"));

    // First event ages out at t=10, second at t=16.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(limiter.is_access_okay("ip"));
    assert!(!limiter.is_access_okay("ip"));
}

#[tokio::test(start_paused = true)]
async fn rejected_calls_do_not_extend_the_block() {
    let limiter = RequestLimiter::new(1, Duration::from_secs(2));
    assert!(limiter.is_access_okay("ip"));
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!limiter.is_access_okay("ip"));
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(limiter.is_access_okay("ip"));
}

#[tokio::test(start_paused = true)]
async fn identities_are_isolated() {
    let limiter = RequestLimiter::new(1, Duration::from_secs(60));
    assert!(limiter.is_access_okay("a"));
    assert!(!limiter.is_access_okay("a"));
    assert!(limiter.is_access_okay("b"));
}

#[tokio::test(start_paused = true)]
async fn rejection_carries_retry_after() {
    let limiter = RequestLimiter::new(2, Duration::from_secs(30));
    limiter.check("ip", 0).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    limiter.check("ip", 0).unwrap();

    match limiter.check("ip", 0) {
        Err(SkaldError::RateLimitExceeded { retry_after }) => {
            assert_eq!(retry_after, Some(Duration::from_secs(20)));
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_the_limit() {
    let limiter = Arc::new(RequestLimiter::new(50, Duration::from_secs(3600)));
    let admitted = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let limiter = Arc::clone(&limiter);
        let admitted = Arc::clone(&admitted);
        tasks.push(tokio::spawn(async move {
            for _ in 0..100 {
                if limiter.is_access_okay("shared") {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for result in futures_util::future::join_all(tasks).await {
        result.unwrap();
    }
    assert_eq!(admitted.load(Ordering::SeqCst), 50);
}

#[test]
fn identity_churn_stays_bounded() {
    let limiter = RequestLimiter::with_config(
        LimiterConfig::new(5, Duration::from_secs(3600)).max_identities(100),
    );
    for i in 0..10_000 {
        let _ = limiter.is_access_okay(&format!("198.51.{}.{}", i / 256, i % 256));
        if i % 500 == 0 {
            limiter.sweep();
        }
    }
    for _ in 0..8 {
        limiter.sweep();
    }
    let tracked = limiter.tracked_identities();
    assert!(tracked <= 100, "tracking {tracked} identities, bound is 100");
}

// ============================================================================
// ErrorRequestLimiter
// ============================================================================

#[tokio::test(start_paused = true)]
async fn error_limiter_independence() {
    let limiter = ErrorRequestLimiter::new(3, Duration::from_secs(1));

    for _ in 0..4 {
        limiter.log_access("ip1");
    }
    assert!(!limiter.would_access_be_okay("ip1"));
    assert!(limiter.would_access_be_okay("ip2"));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(limiter.would_access_be_okay("ip1"));
}

#[tokio::test(start_paused = true)]
async fn error_limiter_queries_do_not_count() {
    let limiter = ErrorRequestLimiter::new(1, Duration::from_secs(10));
    limiter.log_access("ip");
    for _ in 0..20 {
        assert!(limiter.would_access_be_okay("ip"));
    }
}

#[tokio::test(start_paused = true)]
async fn error_limiter_reports_too_many_errors() {
    let limiter = ErrorRequestLimiter::new(1, Duration::from_secs(10));
    limiter.log_access("ip");
    tokio::time::sleep(Duration::from_secs(4)).await;
    limiter.log_access("ip");

    let err = limiter.check("ip").unwrap_err();
    assert!(matches!(err, SkaldError::TooManyErrors { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(6)));
    assert_eq!(err.status_code(), 429);
}
