//! Continuous-capture worker.
//!
//! While continuous mode is active one background task owns the camera
//! stream: it opens the shutter, starts streaming, polls for ready frames
//! with a bounded backoff and routes each frame to the sink when a stack is
//! open. The control task publishes which stack is open (and how Z is
//! moving) through a `watch` channel. The worker acknowledges every context
//! generation it has switched to, so closing a stack can wait until no
//! frame for it is still in flight.
//!
//! The task's `JoinHandle` carries its outcome: `Ok(CaptureStats)` after a
//! requested stop, or the device/sink error that ended it.

use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::sink::{OutputSink, Slice};
use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::{Camera, Frame, FrameProducer, Illumination, ShutterControl};

/// Shortest wait after a poll that returned no frame.
const MIN_BACKOFF: Duration = Duration::from_millis(1);
/// Longest wait after consecutive empty polls.
const MAX_BACKOFF: Duration = Duration::from_millis(20);

/// Counters reported by a worker that was stopped on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Frames handed to the sink
    pub frames_routed: u64,
    /// Frames that arrived while no stack was open
    pub frames_dropped: u64,
    /// `poll_frame` calls
    pub polls: u64,
}

/// Stack the worker should route frames into.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OpenStack {
    pub time_point: usize,
    pub row: usize,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub z_start: f64,
    pub z_end: f64,
    /// Sweep speed; zero while Z holds position
    pub z_speed: f64,
    pub opened: Instant,
    pub metadata: BTreeMap<String, f64>,
}

impl OpenStack {
    /// Z estimated from elapsed sweep time, clamped to the sweep end
    pub(crate) fn z_at(&self, now: Instant) -> f64 {
        if self.z_speed <= 0.0 {
            return self.z_start;
        }
        let span = self.z_end - self.z_start;
        let travelled = (self.z_speed * now.duration_since(self.opened).as_secs_f64()).min(span.abs());
        self.z_start + travelled.copysign(span)
    }

    fn slice(&self, frame: Frame, run_started: Instant) -> Slice {
        let now = Instant::now();
        Slice {
            frame,
            x: self.x,
            y: self.y,
            z: self.z_at(now),
            theta: self.theta,
            elapsed_secs: now.duration_since(run_started).as_secs_f64(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StackContext {
    generation: u64,
    open: Option<OpenStack>,
}

/// Handle to the running capture task.
pub(crate) struct CaptureWorker {
    handle: Option<JoinHandle<anyhow::Result<CaptureStats>>>,
    stop: CancellationToken,
    context: watch::Sender<StackContext>,
    ack: watch::Receiver<u64>,
    generation: u64,
}

impl CaptureWorker {
    /// Spawn the worker. `run_token` cancels it along with the run.
    pub(crate) fn spawn(
        camera: Arc<dyn Camera>,
        illumination: Arc<dyn Illumination>,
        sink: Arc<dyn OutputSink>,
        run_token: &CancellationToken,
        run_started: Instant,
    ) -> Self {
        let stop = run_token.child_token();
        let (context, context_rx) = watch::channel(StackContext::default());
        let (ack_tx, ack) = watch::channel(0);

        let task = CaptureTask {
            camera,
            illumination,
            sink,
            stop: stop.clone(),
            context: context_rx,
            ack: ack_tx,
            run_started,
        };
        let handle = tokio::spawn(task.run());
        debug!("Continuous capture worker started");

        Self {
            handle: Some(handle),
            stop,
            context,
            ack,
            generation: 0,
        }
    }

    /// Start routing frames into `stack`
    pub(crate) fn open_stack(&mut self, stack: OpenStack) {
        self.publish(Some(stack));
    }

    /// Stop routing frames and wait until the worker has let go of the
    /// previous stack.
    pub(crate) async fn close_stack(&mut self, token: &CancellationToken) -> AcqResult<()> {
        let generation = self.publish(None);
        let mut ack = self.ack.clone();
        let acknowledged = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AcquisitionError::Cancelled),
            acked = ack.wait_for(|seen| *seen >= generation) => acked.is_ok(),
        };
        if acknowledged {
            Ok(())
        } else {
            Err(self.exit_error().await)
        }
    }

    /// Liveness check: an error if the worker has ended on its own
    pub(crate) async fn check_alive(&mut self) -> AcqResult<()> {
        let finished = self
            .handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished());
        if finished {
            return Err(self.exit_error().await);
        }
        Ok(())
    }

    /// Cancel the worker and wait for it to stop streaming.
    pub(crate) async fn stop(mut self) -> AcqResult<CaptureStats> {
        self.stop.cancel();
        let Some(handle) = self.handle.take() else {
            return Err(AcquisitionError::CaptureWorkerExited);
        };
        match handle.await {
            Ok(Ok(stats)) => {
                debug!(?stats, "Continuous capture worker stopped");
                Ok(stats)
            }
            Ok(Err(e)) => Err(AcquisitionError::CaptureWorker(e)),
            Err(join) => Err(AcquisitionError::CaptureWorker(anyhow::anyhow!(
                "worker task failed: {join}"
            ))),
        }
    }

    fn publish(&mut self, open: Option<OpenStack>) -> u64 {
        self.generation += 1;
        self.context.send_replace(StackContext {
            generation: self.generation,
            open,
        });
        self.generation
    }

    /// Join a worker that ended without being stopped and describe why.
    async fn exit_error(&mut self) -> AcquisitionError {
        let Some(handle) = self.handle.take() else {
            return AcquisitionError::CaptureWorkerExited;
        };
        match handle.await {
            Ok(Ok(_)) => AcquisitionError::CaptureWorkerExited,
            Ok(Err(e)) => {
                error!(error = %e, "Continuous capture worker failed");
                AcquisitionError::CaptureWorker(e)
            }
            Err(join) => AcquisitionError::CaptureWorker(anyhow::anyhow!(
                "worker task failed: {join}"
            )),
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct CaptureTask {
    camera: Arc<dyn Camera>,
    illumination: Arc<dyn Illumination>,
    sink: Arc<dyn OutputSink>,
    stop: CancellationToken,
    context: watch::Receiver<StackContext>,
    ack: watch::Sender<u64>,
    run_started: Instant,
}

impl CaptureTask {
    async fn run(mut self) -> anyhow::Result<CaptureStats> {
        self.illumination
            .open_shutter()
            .await
            .context("opening shutter for continuous capture")?;
        let result = match self.camera.start_stream().await {
            Ok(()) => self.stream_frames().await,
            Err(e) => Err(e.context("starting camera stream")),
        };

        if let Err(e) = self.camera.stop_stream().await {
            warn!(error = %e, "Failed to stop camera stream");
        }
        if let Err(e) = self.illumination.close_shutter().await {
            warn!(error = %e, "Failed to close shutter after continuous capture");
        }
        result
    }

    async fn stream_frames(&mut self) -> anyhow::Result<CaptureStats> {
        let mut stats = CaptureStats::default();
        let mut backoff = MIN_BACKOFF;

        loop {
            let context = self.context.borrow_and_update().clone();
            self.ack.send_replace(context.generation);

            let polled = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                polled = self.camera.poll_frame() => polled.context("polling camera stream")?,
            };
            stats.polls += 1;

            let Some(frame) = polled else {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            };
            backoff = MIN_BACKOFF;

            match &context.open {
                Some(stack) => {
                    let slice = stack.slice(frame, self.run_started);
                    trace!(time_point = stack.time_point, row = stack.row, z = slice.z, "Streamed slice");
                    self.sink
                        .process_slice(stack.time_point, stack.row, slice)
                        .await
                        .context("routing streamed frame")?;
                    stats.frames_routed += 1;
                }
                None => stats.frames_dropped += 1,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::MemorySink;
    use crate::hardware::mock::{MockCamera, MockShutter};

    fn open(time_point: usize, row: usize) -> OpenStack {
        OpenStack {
            time_point,
            row,
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            z_start: 10.0,
            z_end: 0.0,
            z_speed: 5.0,
            opened: Instant::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn z_follows_the_sweep() {
        let stack = open(0, 0);
        let start = stack.opened;
        assert_eq!(stack.z_at(start), 10.0);
        assert_eq!(stack.z_at(start + Duration::from_secs(1)), 5.0);
        assert_eq!(stack.z_at(start + Duration::from_secs(10)), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn routes_only_into_open_stacks() {
        let camera = Arc::new(MockCamera::new(4, 4).with_frame_period(Duration::from_millis(10)));
        let shutter = Arc::new(MockShutter::new(false));
        let sink = Arc::new(MemorySink::new());
        let token = CancellationToken::new();

        let mut worker = CaptureWorker::spawn(
            camera.clone(),
            shutter.clone(),
            sink.clone(),
            &token,
            Instant::now(),
        );

        sleep(Duration::from_millis(55)).await;
        sink.begin_stack(0, 0).await.unwrap();
        worker.open_stack(open(0, 0));
        sleep(Duration::from_millis(100)).await;
        worker.close_stack(&token).await.unwrap();
        sink.finalize_stack(0, 0).await.unwrap();
        worker.check_alive().await.unwrap();

        let stats = worker.stop().await.unwrap();
        assert!(stats.frames_dropped >= 4, "{stats:?}");
        assert!(stats.frames_routed >= 9, "{stats:?}");
        assert_eq!(sink.stacks()[0].slices as u64, stats.frames_routed);
        assert!(!camera.is_streaming().await.unwrap());
        assert_eq!(shutter.transitions(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_failure_is_reported() {
        let camera = Arc::new(MockCamera::new(4, 4).with_frame_period(Duration::from_millis(10)));
        camera.fail_stream_after(3);
        let shutter = Arc::new(MockShutter::new(false));
        let token = CancellationToken::new();

        let mut worker = CaptureWorker::spawn(
            camera,
            shutter.clone(),
            Arc::new(MemorySink::new()),
            &token,
            Instant::now(),
        );
        sleep(Duration::from_millis(200)).await;

        let err = worker.check_alive().await.unwrap_err();
        assert!(matches!(err, AcquisitionError::CaptureWorker(_)));
        assert!(!shutter.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_run_stops_the_worker() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let token = CancellationToken::new();
        let worker = CaptureWorker::spawn(
            camera.clone(),
            Arc::new(MockShutter::new(false)),
            Arc::new(MemorySink::new()),
            &token,
            Instant::now(),
        );

        sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert!(worker.stop().await.is_ok());
        assert!(!camera.is_streaming().await.unwrap());
    }
}
