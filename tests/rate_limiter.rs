use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gitrix_bridge::rate_limiter::RateLimiter;

/// Black-box check that jobs dispatch one at a time, spaced by the current
/// delay, matching the original `RateLimiter.schedule`/`_do_schedule` pair
/// (spec.md §4.1).
#[tokio::test(start_paused = true)]
async fn dispatches_queued_jobs_one_per_delay_interval() {
    let limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(60), 1.8, 0.8);
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let count = count.clone();
        limiter
            .schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

/// `fail()` backs the delay off geometrically and `success()` recovers it,
/// both observable only through dispatch timing from outside the module
/// (spec.md §4.1 "RateLimiter").
#[tokio::test(start_paused = true)]
async fn fail_widens_the_gap_between_dispatched_jobs() {
    let limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(600), 2.0, 0.5);
    limiter.fail().await;
    limiter.fail().await;

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let count = count.clone();
        limiter.schedule(move || { count.fetch_add(1, Ordering::SeqCst); }).await;
    }

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Backed-off delay is 10 * 2.0 * 2.0 = 40s; the un-failed 10s minimum
    // would have already fired the second job by now.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}
