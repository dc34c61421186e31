//! The acquisition run loop.
//!
//! ```text
//! for time_point in 0..T
//!     [spawn continuous worker]
//!     for row in rows
//!         move to row start → begin stack → capture (plane | Z steps | sweep)
//!         → finalize stack → [drift: finish stack, translate row]
//!         [worker liveness check]
//!     [stop worker]
//!     wait for next time point
//! ```
//!
//! Every suspension point selects on the run's cancellation token, so an
//! abort never lets another motion command start. Whatever ends the run,
//! cleanup restores the auto-shutter, stops streaming, closes the shutter and
//! finalizes the output exactly once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::continuous::{CaptureWorker, OpenStack};
use super::params::AcquisitionParams;
use super::progress::ProgressTracker;
use super::sink::{FinalImageResult, Slice};
use super::status::AcquisitionStatus;
use crate::drift::{DriftController, Vector3};
use crate::error::{AcqResult, AcquisitionError, DeviceResultExt};
use crate::hardware::{
    AutoShutter, DeviceSet, Frame, FrameProducer, Movable, Readable, ShutterControl, StageAxis,
};
use crate::sequence::{Axis, Row};
use crate::watchdog::Watchdog;

/// A drift correction applied to a row's program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AppliedCorrection {
    /// Time point whose stack produced it
    pub time_point: usize,
    /// Row it was applied to
    pub row: usize,
    /// Translation in stage units
    pub offset: Vector3,
}

/// How a run ended and what it produced.
#[derive(Debug)]
pub struct AcquisitionOutcome {
    /// Identifier carried by every log line of the run
    pub run_id: Uuid,
    /// Wall-clock start of the run
    pub started_at: DateTime<Utc>,
    /// `Done` or `Aborted`
    pub status: AcquisitionStatus,
    /// What the output sink produced
    pub result: FinalImageResult,
    /// Why the run aborted
    pub abort_reason: Option<AcquisitionError>,
    /// Drift corrections in the order they were applied
    pub corrections: Vec<AppliedCorrection>,
    /// Wall time of the run
    pub elapsed: Duration,
}

impl AcquisitionOutcome {
    /// Whether every time point completed
    pub fn is_done(&self) -> bool {
        self.status == AcquisitionStatus::Done
    }
}

/// Acquisition orchestrator for one microscope.
///
/// Holds its own status; separate instances never interfere. `run` takes
/// `&self` so another task can call [`abort`](Self::abort) while it runs.
///
/// The run executes on its own control task. Dropping the `run` future
/// cancels that task, which still performs the full cleanup before the
/// status leaves `Running`.
///
/// # Example
///
/// ```rust,ignore
/// let acquisition = Arc::new(Acquisition::new(devices));
/// let outcome = acquisition.run(params).await?;
/// println!("{} after {:?}", outcome.status, outcome.elapsed);
/// ```
pub struct Acquisition {
    shared: Arc<Shared>,
}

struct Shared {
    devices: DeviceSet,
    status: Mutex<AcquisitionStatus>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Acquisition {
    /// Orchestrator driving `devices`
    pub fn new(devices: DeviceSet) -> Self {
        Self {
            shared: Arc::new(Shared {
                devices,
                status: Mutex::new(AcquisitionStatus::Init),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// The devices this orchestrator drives
    pub fn devices(&self) -> &DeviceSet {
        &self.shared.devices
    }

    /// Current lifecycle state
    pub fn status(&self) -> AcquisitionStatus {
        *self.shared.status.lock()
    }

    /// Request cancellation of the current run. Returns whether a run was
    /// in progress.
    pub fn abort(&self) -> bool {
        match self.shared.cancel.lock().as_ref() {
            Some(token) => {
                info!("Abort requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute a run.
    ///
    /// Fails without touching hardware if a run is already in progress or
    /// the parameters are invalid. Once the run has started, faults and
    /// cancellation are reported through an `Aborted` outcome rather than
    /// an error.
    pub async fn run(&self, params: AcquisitionParams) -> AcqResult<AcquisitionOutcome> {
        let token = self.shared.begin(&params)?;
        let _cancel_on_drop = token.clone().drop_guard();

        let shared = self.shared.clone();
        let control = tokio::spawn(async move {
            let slot = RunSlot::new(&shared);
            let outcome = shared.execute(&params, token).await;
            slot.release(outcome.status);
            outcome
        });

        match control.await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(AcquisitionError::Cancelled),
        }
    }
}

impl Shared {
    fn begin(&self, params: &AcquisitionParams) -> AcqResult<CancellationToken> {
        let mut status = self.status.lock();
        if !status.can_begin() {
            return Err(AcquisitionError::AlreadyRunning);
        }
        params.validate(&self.devices)?;
        *status = AcquisitionStatus::Running;
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        Ok(token)
    }

    async fn execute(&self, params: &AcquisitionParams, token: CancellationToken) -> AcquisitionOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            started_at = %started_at.to_rfc3339(),
            time_points = params.time_points,
            rows = params.rows.len(),
            continuous = params.continuous,
            drift = params.drift.is_some(),
            "Acquisition started"
        );

        let mut run = Run::new(&self.devices, params, token);
        let executed = run.execute().await;
        let mut abort_reason = executed.err().map(|e| run.classify(e));
        if let Some(reason) = &abort_reason {
            error!(%run_id, error = %reason, "Acquisition aborted");
        }

        let finalized = run.cleanup(abort_reason.is_none()).await;
        let result = match finalized {
            Ok(result) => result,
            Err(e) => {
                error!(%run_id, error = %e, "Output finalization failed");
                abort_reason.get_or_insert(e);
                FinalImageResult::failed()
            }
        };

        let status = if abort_reason.is_none() {
            AcquisitionStatus::Done
        } else {
            AcquisitionStatus::Aborted
        };
        let elapsed = run.started.elapsed();
        let corrections = std::mem::take(&mut run.corrections);
        info!(%run_id, %status, ?elapsed, slices = result.total_slices, "Acquisition finished");

        AcquisitionOutcome {
            run_id,
            started_at,
            status,
            result,
            abort_reason,
            corrections,
            elapsed,
        }
    }
}

/// Occupancy of the orchestrator by one run. Releases the status and the
/// abort handle even if the control task unwinds.
struct RunSlot<'a> {
    shared: &'a Shared,
    status: AcquisitionStatus,
}

impl<'a> RunSlot<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            status: AcquisitionStatus::Aborted,
        }
    }

    fn release(mut self, status: AcquisitionStatus) {
        self.status = status;
    }
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        *self.shared.cancel.lock() = None;
        *self.shared.status.lock() = self.status;
    }
}

/// State of one run, owned by the control task.
struct Run<'a> {
    devices: &'a DeviceSet,
    params: &'a AcquisitionParams,
    token: CancellationToken,
    started: Instant,
    rows: Vec<Row>,
    controllers: HashMap<usize, Box<dyn DriftController>>,
    corrections: Vec<AppliedCorrection>,
    progress: ProgressTracker,
    watchdog: Watchdog,
    worker: Option<CaptureWorker>,
    auto_shutter: Option<bool>,
}

impl<'a> Run<'a> {
    fn new(devices: &'a DeviceSet, params: &'a AcquisitionParams, token: CancellationToken) -> Self {
        let watchdog = if params.abort_on_delay {
            Watchdog::with_target(params.step_timeout, token.clone())
        } else {
            Watchdog::new(params.step_timeout)
        };
        Self {
            devices,
            params,
            token,
            started: Instant::now(),
            rows: params.rows.clone(),
            controllers: HashMap::new(),
            corrections: Vec::new(),
            progress: ProgressTracker::new(
                params.time_points,
                params.rows.len(),
                params.progress.clone(),
            ),
            watchdog,
            worker: None,
            auto_shutter: None,
        }
    }

    async fn execute(&mut self) -> AcqResult<()> {
        let illumination = self.devices.illumination().clone();
        let light = self.devices.illumination_id().to_string();
        let prior = illumination.auto_shutter().await.device(&light, "read auto-shutter")?;
        self.auto_shutter = Some(prior);
        illumination
            .set_auto_shutter(false)
            .await
            .device(&light, "disable auto-shutter")?;

        for time_point in 0..self.params.time_points {
            info!(time_point, of = self.params.time_points, "Time point");
            if self.params.continuous {
                self.worker = Some(CaptureWorker::spawn(
                    self.devices.camera().clone(),
                    illumination.clone(),
                    self.params.output.clone(),
                    &self.token,
                    self.started,
                ));
            }

            for row in 0..self.rows.len() {
                self.acquire_row(time_point, row).await?;
                if let Some(worker) = self.worker.as_mut() {
                    worker.check_alive().await?;
                }
            }

            if let Some(worker) = self.worker.take() {
                let stats = worker.stop().await?;
                debug!(time_point, ?stats, "Continuous capture finished");
            }

            if time_point + 1 < self.params.time_points {
                self.wait_for_time_point(time_point + 1).await?;
            }
        }

        self.progress.finish();
        Ok(())
    }

    async fn acquire_row(&mut self, time_point: usize, index: usize) -> AcqResult<()> {
        let row = self.rows[index].clone();
        let mut controller = match &self.params.drift {
            Some(factory) if !row.is_z_continuous() => Some(
                self.controllers
                    .remove(&index)
                    .unwrap_or_else(|| factory.create(index, &row)),
            ),
            _ => None,
        };

        debug!(time_point, row = index, program = %row, "Row");
        for (axis, values) in row.axes() {
            self.move_axis(axis, values.start()).await?;
        }

        let output = self.params.output.clone();
        output
            .begin_stack(time_point, index)
            .await
            .map_err(AcquisitionError::Output)?;
        if let Some(controller) = controller.as_mut() {
            controller.start_new_stack();
        }

        let captured = self
            .acquire_stack(time_point, index, &row, controller.as_deref_mut())
            .await;
        let closed = self.close_stack(time_point, index).await;
        captured?;
        closed?;

        if let Some(mut controller) = controller {
            let finished = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(self.interrupted()),
                correction = controller.finish_stack() => correction,
            };
            if let Some(offset) = finished {
                self.rows[index].translate(offset.x, offset.y, offset.z);
                self.corrections.push(AppliedCorrection {
                    time_point,
                    row: index,
                    offset,
                });
                if !offset.is_zero() {
                    info!(time_point, row = index, %offset, "Row translated for drift");
                }
            }
            self.controllers.insert(index, controller);
        }
        Ok(())
    }

    async fn acquire_stack(
        &mut self,
        time_point: usize,
        row_index: usize,
        row: &Row,
        mut controller: Option<&mut (dyn DriftController + 'static)>,
    ) -> AcqResult<()> {
        if self.params.illuminate_full_stack && !self.params.continuous {
            let light = self.devices.illumination_id();
            self.devices
                .illumination()
                .open_shutter()
                .await
                .device(light, "open shutter")?;
        }

        if self.params.continuous {
            return self.stream_stack(time_point, row_index, row).await;
        }

        if row.is_single_plane() {
            self.capture_slice(time_point, row_index, controller).await?;
            self.progress.stack(time_point, row_index, 1.0);
            return Ok(());
        }

        let planes = row.z().map(|z| z.values()).unwrap_or_default();
        let count = planes.len();
        for (i, z) in planes.into_iter().enumerate() {
            self.move_axis(Axis::Z, z).await?;
            self.capture_slice(time_point, row_index, controller.as_deref_mut())
                .await?;
            self.progress
                .stack(time_point, row_index, (i + 1) as f64 / count as f64);
        }
        Ok(())
    }

    /// Continuous mode: the worker records while Z sweeps (or holds).
    async fn stream_stack(&mut self, time_point: usize, row_index: usize, row: &Row) -> AcqResult<()> {
        let positions = self.read_positions().await?;
        let metadata = self.sample_metadata().await?;
        let z_start = row.z_start().unwrap_or(positions.z);
        let z_end = row.z_end().unwrap_or(z_start);
        let z_speed = row.z_velocity().unwrap_or(0.0);
        let stack = OpenStack {
            time_point,
            row: row_index,
            x: positions.x,
            y: positions.y,
            theta: positions.theta,
            z_start,
            z_end,
            z_speed,
            opened: Instant::now(),
            metadata,
        };

        let recorded = if row.is_z_continuous() {
            self.sweep_z(stack, z_end, z_speed).await
        } else {
            self.open_worker_stack(stack)?;
            self.settle().await
        };
        let released = match self.worker.as_mut() {
            Some(worker) => worker.close_stack(&self.token).await,
            None => Err(AcquisitionError::CaptureWorkerExited),
        };
        recorded?;
        released?;
        self.progress.stack(time_point, row_index, 1.0);
        Ok(())
    }

    async fn sweep_z(&mut self, stack: OpenStack, end: f64, speed: f64) -> AcqResult<()> {
        let stage = self.stage(Axis::Z)?;
        let Some(velocity) = stage.velocity.clone() else {
            return Err(AcquisitionError::Configuration(format!(
                "stage '{}' has no velocity control",
                stage.id
            )));
        };

        let prior = velocity.velocity().await.device(&stage.id, "read velocity")?;
        velocity
            .set_velocity(speed)
            .await
            .device(&stage.id, "set sweep velocity")?;
        debug!(from = stack.z_start, to = end, speed, "Z sweep");

        let swept = match self.open_worker_stack(stack) {
            Ok(()) => self.move_axis(Axis::Z, end).await,
            Err(e) => Err(e),
        };
        let restored = velocity
            .set_velocity(prior)
            .await
            .device(&stage.id, "restore velocity");
        swept?;
        restored
    }

    fn open_worker_stack(&mut self, stack: OpenStack) -> AcqResult<()> {
        match self.worker.as_mut() {
            Some(worker) => {
                worker.open_stack(stack);
                Ok(())
            }
            None => Err(AcquisitionError::CaptureWorkerExited),
        }
    }

    async fn capture_slice(
        &mut self,
        time_point: usize,
        row: usize,
        controller: Option<&mut (dyn DriftController + 'static)>,
    ) -> AcqResult<()> {
        let camera = self.devices.camera().clone();
        let camera_id = self.devices.camera_id().to_string();

        self.guarded(&camera_id, "wait for image sync", camera.wait_for_sync())
            .await?;
        self.settle().await?;

        let frame = self.expose(&camera_id, camera.capture_frame()).await?;
        if let Some(controller) = controller {
            controller
                .tally(&frame)
                .device(&camera_id, "tally drift projections")?;
        }

        let positions = self.read_positions().await?;
        let metadata = self.sample_metadata().await?;
        let slice = Slice {
            frame,
            x: positions.x,
            y: positions.y,
            z: positions.z,
            theta: positions.theta,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            metadata,
        };
        debug!(time_point, row, z = slice.z, "Slice");
        self.params
            .output
            .process_slice(time_point, row, slice)
            .await
            .map_err(AcquisitionError::Output)
    }

    /// Capture one frame, gating the light around it unless the whole
    /// stack is lit.
    async fn expose<F>(&mut self, camera_id: &str, capture: F) -> AcqResult<Frame>
    where
        F: Future<Output = anyhow::Result<Frame>>,
    {
        let gate = !self.params.illuminate_full_stack;
        let illumination = self.devices.illumination().clone();
        let light = self.devices.illumination_id();

        if gate {
            illumination.open_shutter().await.device(light, "open shutter")?;
        }
        let frame = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.interrupted()),
            frame = capture => frame.device(camera_id, "capture"),
        };
        if gate {
            let closed = illumination.close_shutter().await.device(light, "close shutter");
            let frame = frame?;
            closed?;
            return Ok(frame);
        }
        frame
    }

    async fn close_stack(&mut self, time_point: usize, row: usize) -> AcqResult<()> {
        let finalized = self
            .params
            .output
            .finalize_stack(time_point, row)
            .await
            .map_err(AcquisitionError::Output);
        if self.params.illuminate_full_stack && !self.params.continuous {
            let light = self.devices.illumination_id();
            self.devices
                .illumination()
                .close_shutter()
                .await
                .device(light, "close shutter")?;
        }
        finalized
    }

    async fn move_axis(&mut self, axis: Axis, target: f64) -> AcqResult<()> {
        let stage = self.stage(axis)?;
        self.guarded(&stage.id, "move", stage.movable.move_abs(target))
            .await?;
        self.guarded(&stage.id, "wait for motion", stage.movable.wait_settled())
            .await
    }

    fn stage(&self, axis: Axis) -> AcqResult<StageAxis> {
        self.devices.axis(axis).cloned().ok_or_else(|| {
            AcquisitionError::Configuration(format!("no stage assigned to {axis}"))
        })
    }

    /// Run one bounded hardware operation under the watchdog.
    ///
    /// Nothing is polled once the run is cancelled.
    async fn guarded<T, F>(&mut self, device: &str, operation: &'static str, op: F) -> AcqResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(self.interrupted());
        }
        self.watchdog.reset();
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AcquisitionError::Cancelled),
            r = op => r.device(device, operation),
        };
        self.watchdog.stop();

        if self.watchdog.is_delayed() {
            warn!(device, operation, timeout = ?self.params.step_timeout, "Hardware wait exceeded watchdog timeout");
        }
        result.map_err(|e| match e {
            AcquisitionError::Cancelled => self.interrupted(),
            other => other,
        })
    }

    async fn settle(&mut self) -> AcqResult<()> {
        let delay = self.params.settle_delay;
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.interrupted()),
            _ = sleep(delay) => Ok(()),
        }
    }

    async fn wait_for_time_point(&mut self, next: usize) -> AcqResult<()> {
        let due = self
            .params
            .schedule_offset(next)
            .and_then(|offset| self.started.checked_add(offset))
            .ok_or_else(|| {
                AcquisitionError::Configuration(format!(
                    "time point {next} lies beyond the schedulable range"
                ))
            })?;
        let now = Instant::now();
        if now >= due {
            if now > due {
                warn!(time_point = next, behind = ?(now - due), "Behind schedule, starting next time point now");
            }
            return Ok(());
        }
        debug!(time_point = next, wait = ?(due - now), "Waiting for next time point");
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.interrupted()),
            _ = sleep_until(due) => Ok(()),
        }
    }

    async fn read_positions(&self) -> AcqResult<Positions> {
        let mut positions = Positions::default();
        for (axis, stage) in self.devices.axes() {
            let value = stage
                .movable
                .position()
                .await
                .device(&stage.id, "read position")?;
            match axis {
                Axis::X => positions.x = value,
                Axis::Y => positions.y = value,
                Axis::Z => positions.z = value,
                Axis::Theta => positions.theta = value,
            }
        }
        Ok(positions)
    }

    async fn sample_metadata(&self) -> AcqResult<BTreeMap<String, f64>> {
        let mut metadata = BTreeMap::new();
        for name in &self.params.metadata_devices {
            let Some(readable) = self.devices.readable(name) else {
                continue;
            };
            let value = readable.read().await.device(name, "read metadata")?;
            metadata.insert(name.clone(), value);
        }
        Ok(metadata)
    }

    /// Cancellation caused by the watchdog is a timeout.
    fn interrupted(&self) -> AcquisitionError {
        if self.watchdog.is_delayed() {
            AcquisitionError::Timeout(self.params.step_timeout)
        } else {
            AcquisitionError::Cancelled
        }
    }

    fn classify(&self, error: AcquisitionError) -> AcquisitionError {
        match error {
            AcquisitionError::Cancelled => self.interrupted(),
            other => other,
        }
    }

    /// Best-effort teardown. Issues no stage motion.
    async fn cleanup(&mut self, success: bool) -> AcqResult<FinalImageResult> {
        self.watchdog.stop();
        let camera = self.devices.camera();
        let illumination = self.devices.illumination();

        match self.worker.take() {
            Some(worker) => {
                if let Err(e) = worker.stop().await {
                    warn!(error = %e, "Continuous capture ended with an error during cleanup");
                }
            }
            None => match camera.is_streaming().await {
                Ok(false) => {}
                Ok(true) | Err(_) => {
                    if let Err(e) = camera.stop_stream().await {
                        warn!(error = %e, "Failed to stop camera stream");
                    }
                }
            },
        }

        if let Err(e) = illumination.close_shutter().await {
            warn!(error = %e, "Failed to close shutter");
        }
        if let Some(prior) = self.auto_shutter {
            if let Err(e) = illumination.set_auto_shutter(prior).await {
                error!(error = %e, "Failed to restore auto-shutter");
            }
        }

        self.params
            .output
            .finalize_acquisition(success)
            .await
            .map_err(AcquisitionError::Output)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Positions {
    x: f64,
    y: f64,
    z: f64,
    theta: f64,
}
