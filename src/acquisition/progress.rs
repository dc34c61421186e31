//! Progress reporting.
//!
//! Reporters must never block the control task. The `mpsc::Sender` impl uses
//! `try_send` and drops updates when the receiver falls behind.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Progress of a run at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Time point being acquired
    pub time_point: usize,
    /// Row being acquired
    pub row: usize,
    /// Fraction of the current stack completed (0.0..=1.0)
    pub stack_fraction: f64,
    /// Fraction of the whole run completed (0.0..=1.0)
    pub overall_fraction: f64,
}

/// Receives progress updates from a running acquisition.
pub trait ProgressReporter: Send + Sync {
    /// Deliver one update. Must return promptly.
    fn report(&self, event: ProgressEvent);
}

impl ProgressReporter for mpsc::Sender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        match self.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    time_point = dropped.time_point,
                    row = dropped.row,
                    "Progress channel full, update dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Computes run-level fractions and keeps them monotonic.
pub(crate) struct ProgressTracker {
    time_points: usize,
    rows: usize,
    last: Option<ProgressEvent>,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl ProgressTracker {
    pub(crate) fn new(
        time_points: usize,
        rows: usize,
        reporter: Option<Arc<dyn ProgressReporter>>,
    ) -> Self {
        Self {
            time_points: time_points.max(1),
            rows: rows.max(1),
            last: None,
            reporter,
        }
    }

    /// Overall fraction for a position in the run
    pub(crate) fn overall(&self, time_point: usize, row: usize, stack_fraction: f64) -> f64 {
        let done = (time_point * self.rows + row) as f64 + stack_fraction.clamp(0.0, 1.0);
        (done / (self.time_points * self.rows) as f64).clamp(0.0, 1.0)
    }

    /// Report progress within the stack (`time_point`, `row`)
    pub(crate) fn stack(&mut self, time_point: usize, row: usize, stack_fraction: f64) {
        let mut event = ProgressEvent {
            time_point,
            row,
            stack_fraction: stack_fraction.clamp(0.0, 1.0),
            overall_fraction: self.overall(time_point, row, stack_fraction),
        };
        if let Some(last) = self.last {
            event.overall_fraction = event.overall_fraction.max(last.overall_fraction);
            if (last.time_point, last.row) == (time_point, row) {
                event.stack_fraction = event.stack_fraction.max(last.stack_fraction);
            }
        }
        self.emit(event);
    }

    /// Report run completion. Emits 1.0 once even if the last stack
    /// already reached it.
    pub(crate) fn finish(&mut self) {
        if self.last.is_some_and(|last| last.overall_fraction >= 1.0) {
            return;
        }
        self.emit(ProgressEvent {
            time_point: self.time_points - 1,
            row: self.rows - 1,
            stack_fraction: 1.0,
            overall_fraction: 1.0,
        });
    }

    fn emit(&mut self, event: ProgressEvent) {
        self.last = Some(event);
        if let Some(reporter) = &self.reporter {
            reporter.report(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn overall_fraction_formula() {
        let tracker = ProgressTracker::new(2, 3, None);
        assert_eq!(tracker.overall(0, 0, 0.0), 0.0);
        assert!((tracker.overall(0, 1, 0.5) - 1.5 / 6.0).abs() < 1e-12);
        assert_eq!(tracker.overall(1, 2, 1.0), 1.0);
    }

    #[tokio::test]
    async fn final_event_is_emitted_once() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut tracker = ProgressTracker::new(1, 1, Some(Arc::new(tx)));
        tracker.stack(0, 0, 0.5);
        tracker.stack(0, 0, 1.0);
        tracker.finish();
        drop(tracker);

        let mut fractions = Vec::new();
        while let Some(event) = rx.recv().await {
            fractions.push(event.overall_fraction);
        }
        assert_eq!(fractions, vec![0.5, 1.0]);
    }

    #[tokio::test]
    #[traced_test]
    async fn full_channel_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut tracker = ProgressTracker::new(1, 4, Some(Arc::new(tx)));
        tracker.stack(0, 0, 1.0);
        tracker.stack(0, 1, 1.0);
        tracker.stack(0, 2, 1.0);

        assert_eq!(rx.recv().await.map(|e| e.row), Some(0));
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("Progress channel full"));
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut tracker = ProgressTracker::new(1, 1, Some(Arc::new(tx)));
        tracker.stack(0, 0, 1.0);
        tracker.finish();
    }
}
