//! Settle watchdog timing
//!
//! Runs on a paused clock: sleeping past the timeout advances time
//! instantly and deterministically.

use spim_daq::Watchdog;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_expired_watchdog_reports_delay_and_cancels_target() {
    let target = CancellationToken::new();
    let mut watchdog = Watchdog::with_target(Duration::from_secs(5), target.clone());

    watchdog.reset();
    assert!(watchdog.is_armed());
    assert!(!watchdog.is_delayed());

    sleep(Duration::from_millis(4_900)).await;
    assert!(!watchdog.is_delayed());
    assert!(!target.is_cancelled());

    sleep(Duration::from_millis(200)).await;
    assert!(watchdog.is_delayed());
    assert!(target.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_target_observes_interruption() {
    let target = CancellationToken::new();
    let mut watchdog = Watchdog::with_target(Duration::from_secs(5), target.clone());

    let worker = tokio::spawn({
        let target = target.clone();
        async move {
            tokio::select! {
                _ = target.cancelled() => "interrupted",
                _ = sleep(Duration::from_secs(60)) => "finished",
            }
        }
    });

    watchdog.reset();
    assert_eq!(worker.await.unwrap(), "interrupted");
    assert!(watchdog.is_delayed());
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_timeout_prevents_delay() {
    let target = CancellationToken::new();
    let mut watchdog = Watchdog::with_target(Duration::from_secs(5), target.clone());

    watchdog.reset();
    sleep(Duration::from_secs(3)).await;
    watchdog.stop();
    assert!(!watchdog.is_armed());

    sleep(Duration::from_secs(10)).await;
    assert!(!watchdog.is_delayed());
    assert!(!target.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_delay_survives_stop() {
    let mut watchdog = Watchdog::new(Duration::from_millis(50));

    watchdog.reset();
    sleep(Duration::from_millis(60)).await;
    watchdog.stop();

    assert!(watchdog.is_delayed());
    assert_eq!(watchdog.timeout(), Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_rearming_restarts_the_window() {
    let target = CancellationToken::new();
    let mut watchdog = Watchdog::with_target(Duration::from_secs(1), target.clone());

    // Each reset starts a fresh window, so five 800ms waits never expire
    for _ in 0..5 {
        watchdog.reset();
        sleep(Duration::from_millis(800)).await;
    }
    watchdog.stop();
    assert!(!target.is_cancelled());

    watchdog.reset();
    let cancelled = timeout(Duration::from_secs(2), target.cancelled()).await;
    assert!(cancelled.is_ok());
}
