// ABOUTME: Tests for the sliding-window rate limiter.
// ABOUTME: Uses a paused tokio clock so window expiry is deterministic.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready};

use super::rate_limiter::{Cancelled, RateLimiter, RateUsage};

#[tokio::test(start_paused = true)]
async fn test_acquire_immediate_under_capacity() {
    let limiter = RateLimiter::new(3, 100);

    let start = Instant::now();
    for _ in 0..3 {
        limiter.acquire().await;
    }

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(
        limiter.usage().await,
        RateUsage {
            last_minute: 3,
            last_hour: 3
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_acquire_waits_for_minute_window() {
    let limiter = RateLimiter::new(2, 100);
    limiter.acquire().await;
    limiter.acquire().await;

    let mut third = tokio_test::task::spawn(limiter.acquire());
    assert_pending!(third.poll());

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_pending!(third.poll());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_ready!(third.poll());
}

#[tokio::test(start_paused = true)]
async fn test_acquire_waits_for_hour_window() {
    let limiter = RateLimiter::with_windows(
        (Duration::from_secs(60), 10),
        (Duration::from_secs(3600), 3),
    );
    for _ in 0..3 {
        limiter.acquire().await;
    }

    let start = Instant::now();
    limiter.acquire().await;
    let waited = start.elapsed();

    assert!(
        waited >= Duration::from_secs(3600),
        "Should wait for the hour window, waited {:?}",
        waited
    );
    // The three original calls have aged out of both windows.
    assert_eq!(limiter.usage().await.last_hour, 1);
}

#[tokio::test(start_paused = true)]
async fn test_entries_age_out_independently() {
    let limiter = RateLimiter::new(5, 100);
    limiter.acquire().await;
    limiter.acquire().await;

    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(
        limiter.usage().await,
        RateUsage {
            last_minute: 0,
            last_hour: 2
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_acquire_cancelled_records_nothing() {
    let limiter = RateLimiter::new(1, 100);
    limiter.acquire().await;

    let cancel = tokio::time::sleep(Duration::from_secs(10));
    let result = limiter.acquire_with_cancel(cancel).await;

    assert_eq!(result, Err(Cancelled));
    assert_eq!(limiter.usage().await.last_minute, 1);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_with_cancel_succeeds_when_room() {
    let limiter = RateLimiter::new(1, 100);
    let result = limiter.acquire_with_cancel(std::future::pending::<()>()).await;
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquires_throttled() {
    let limiter = Arc::new(RateLimiter::new(4, 100));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.acquire().await;
            Instant::now()
        }));
    }

    let mut finished = Vec::new();
    for handle in handles {
        finished.push(handle.await.unwrap());
    }

    let immediate = finished.iter().filter(|t| **t == start).count();
    assert_eq!(immediate, 4, "Only the first four calls fit the window");
    assert!(
        finished
            .iter()
            .all(|t| *t == start || t.duration_since(start) >= Duration::from_secs(60))
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_waiters_never_exceed_minute_ceiling() {
    let limiter = Arc::new(RateLimiter::new(2, 1000));
    let start = Instant::now();
    limiter.acquire().await;
    limiter.acquire().await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.acquire().await;
            Instant::now()
        }));
    }

    // Sample the window while the waiters drain.
    for _ in 0..320 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let usage = limiter.usage().await;
        assert!(
            usage.last_minute <= 2,
            "minute window holds {} calls",
            usage.last_minute
        );
    }

    let mut finished = vec![start, start];
    for handle in handles {
        finished.push(handle.await.unwrap());
    }
    for t in &finished {
        let in_window = finished
            .iter()
            .filter(|other| **other <= *t && t.duration_since(**other) < Duration::from_secs(60))
            .count();
        assert!(in_window <= 2, "{} calls inside one minute", in_window);
    }
    assert_eq!(limiter.usage().await.last_hour, 12);
}

#[test]
#[should_panic(expected = "capacity must be positive")]
fn test_zero_capacity_panics() {
    let _ = RateLimiter::new(0, 10);
}

#[test]
fn test_cancelled_error_display() {
    let err = Cancelled;
    assert_eq!(err.to_string(), "operation cancelled");
}
