//! Settle/delay watchdog.
//!
//! Guards one bounded operation at a time. While armed, a background timer
//! waits for the timeout; if `stop()` has not been called by then the
//! watchdog marks itself delayed and, when a target token was supplied,
//! cancels it. The acquisition passes its run token as the target so a hung
//! stage wait becomes a cooperative abort.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut watchdog = Watchdog::with_target(Duration::from_secs(5), run_token.clone());
//! watchdog.reset();
//! stage.wait_settled().await?;
//! watchdog.stop();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

struct ArmedTimer {
    disarm: CancellationToken,
    task: JoinHandle<()>,
}

/// One-shot timer that flags (and optionally cancels) a stalled operation.
pub struct Watchdog {
    timeout: Duration,
    target: Option<CancellationToken>,
    delayed: Arc<AtomicBool>,
    armed: Option<ArmedTimer>,
}

impl Watchdog {
    /// Watchdog that only records delays
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            target: None,
            delayed: Arc::new(AtomicBool::new(false)),
            armed: None,
        }
    }

    /// Watchdog that cancels `target` when it fires
    pub fn with_target(timeout: Duration, target: CancellationToken) -> Self {
        let mut watchdog = Self::new(timeout);
        watchdog.target = Some(target);
        watchdog
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// (Re)start the timer. Clears a previous delay.
    ///
    /// Must be called from within a tokio runtime.
    pub fn reset(&mut self) {
        self.disarm();
        self.delayed.store(false, Ordering::SeqCst);

        let disarm = CancellationToken::new();
        let stopped = disarm.clone();
        let delayed = Arc::clone(&self.delayed);
        let target = self.target.clone();
        let timeout = self.timeout;

        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stopped.cancelled() => {}
                _ = sleep(timeout) => {
                    delayed.store(true, Ordering::SeqCst);
                    tracing::warn!(?timeout, interrupting = target.is_some(), "Watchdog expired");
                    if let Some(target) = target {
                        target.cancel();
                    }
                }
            }
        });

        self.armed = Some(ArmedTimer { disarm, task });
    }

    /// Cancel the timer. `is_delayed()` keeps its value.
    pub fn stop(&mut self) {
        self.disarm();
    }

    /// Whether the timeout elapsed while armed
    pub fn is_delayed(&self) -> bool {
        self.delayed.load(Ordering::SeqCst)
    }

    /// Whether a timer is currently running
    pub fn is_armed(&self) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|armed| !armed.task.is_finished())
    }

    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.disarm.cancel();
            armed.task.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout", &self.timeout)
            .field("has_target", &self.target.is_some())
            .field("delayed", &self.is_delayed())
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dropped_watchdog_never_fires() {
        let token = CancellationToken::new();
        {
            let mut watchdog = Watchdog::with_target(Duration::from_millis(10), token.clone());
            watchdog.reset();
        }
        sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_previous_delay() {
        let mut watchdog = Watchdog::new(Duration::from_millis(10));
        watchdog.reset();
        sleep(Duration::from_millis(20)).await;
        assert!(watchdog.is_delayed());

        watchdog.reset();
        assert!(!watchdog.is_delayed());
        assert!(watchdog.is_armed());
        watchdog.stop();
        assert!(!watchdog.is_armed());
    }
}
