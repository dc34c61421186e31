//! Run parameters and pre-flight validation.

use std::sync::Arc;
use std::time::Duration;

use super::progress::ProgressReporter;
use super::sink::OutputSink;
use crate::drift::DriftControllerFactory;
use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::DeviceSet;
use crate::sequence::{Axis, Row};

/// Default bound on a single stage or camera-sync wait.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of one acquisition run. Read-only once `run()` starts.
///
/// # Example
///
/// ```rust,ignore
/// let params = AcquisitionParams::new(rows, sink)
///     .with_time_points(10)
///     .with_interval(Duration::from_secs(60))
///     .with_settle_delay(Duration::from_millis(20));
/// ```
#[derive(Clone)]
pub struct AcquisitionParams {
    /// Stage positions, acquired in order at every time point
    pub rows: Vec<Row>,
    /// Number of time points
    pub time_points: usize,
    /// Start-to-start spacing of time points
    pub interval: Duration,
    /// Stream frames from a background worker instead of per-slice snaps
    pub continuous: bool,
    /// Wait after each motion before capturing
    pub settle_delay: Duration,
    /// Watchdog timeout for each bounded hardware wait
    pub step_timeout: Duration,
    /// Whether a watchdog expiry aborts the run (otherwise it is only logged)
    pub abort_on_delay: bool,
    /// Keep the light on for a whole stack rather than per exposure
    pub illuminate_full_stack: bool,
    /// Readable devices sampled into every slice's metadata
    pub metadata_devices: Vec<String>,
    /// Where stacks go
    pub output: Arc<dyn OutputSink>,
    /// Per-row drift controllers; `None` disables drift compensation
    pub drift: Option<Arc<dyn DriftControllerFactory>>,
    /// Progress receiver
    pub progress: Option<Arc<dyn ProgressReporter>>,
}

impl AcquisitionParams {
    /// Single time point, stepped capture, no settle delay, no drift
    pub fn new(rows: Vec<Row>, output: Arc<dyn OutputSink>) -> Self {
        Self {
            rows,
            time_points: 1,
            interval: Duration::ZERO,
            continuous: false,
            settle_delay: Duration::ZERO,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            abort_on_delay: true,
            illuminate_full_stack: false,
            metadata_devices: Vec::new(),
            output,
            drift: None,
            progress: None,
        }
    }

    /// Set the number of time points
    pub fn with_time_points(mut self, time_points: usize) -> Self {
        self.time_points = time_points;
        self
    }

    /// Set the time point interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enable or disable continuous capture
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Set the settle delay
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the watchdog timeout
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Choose whether watchdog expiry aborts the run
    pub fn with_abort_on_delay(mut self, abort: bool) -> Self {
        self.abort_on_delay = abort;
        self
    }

    /// Keep illumination on for whole stacks
    pub fn with_full_stack_illumination(mut self, enabled: bool) -> Self {
        self.illuminate_full_stack = enabled;
        self
    }

    /// Sample `devices` into slice metadata
    pub fn with_metadata_devices(mut self, devices: Vec<String>) -> Self {
        self.metadata_devices = devices;
        self
    }

    /// Enable drift compensation
    pub fn with_drift(mut self, factory: Arc<dyn DriftControllerFactory>) -> Self {
        self.drift = Some(factory);
        self
    }

    /// Report progress to `reporter`
    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    /// Check the parameters against the devices. Touches no hardware.
    pub fn validate(&self, devices: &DeviceSet) -> AcqResult<()> {
        if self.continuous && self.drift.is_some() {
            return Err(AcquisitionError::ContinuousWithDrift);
        }
        if self.rows.is_empty() {
            return Err(config_error("at least one row is required"));
        }
        if self.time_points == 0 {
            return Err(config_error("time_points must be at least 1"));
        }
        if self.step_timeout.is_zero() {
            return Err(config_error("step timeout must be positive"));
        }
        let last = self.time_points - 1;
        if self
            .schedule_offset(last)
            .and_then(|offset| tokio::time::Instant::now().checked_add(offset))
            .is_none()
        {
            return Err(config_error(format!(
                "interval {:?} cannot schedule {} time points",
                self.interval, self.time_points
            )));
        }

        for (index, row) in self.rows.iter().enumerate() {
            validate_row(index, row, self.continuous, devices)?;
        }

        for name in &self.metadata_devices {
            if devices.readable(name).is_none() {
                return Err(config_error(format!(
                    "metadata device '{name}' is not a readable device"
                )));
            }
        }
        Ok(())
    }
}

impl AcquisitionParams {
    /// Start of `time_point` relative to the run start, if representable
    pub(crate) fn schedule_offset(&self, time_point: usize) -> Option<Duration> {
        let index = u32::try_from(time_point).ok()?;
        self.interval.checked_mul(index)
    }
}

impl std::fmt::Debug for AcquisitionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionParams")
            .field("rows", &self.rows.len())
            .field("time_points", &self.time_points)
            .field("interval", &self.interval)
            .field("continuous", &self.continuous)
            .field("settle_delay", &self.settle_delay)
            .field("step_timeout", &self.step_timeout)
            .field("abort_on_delay", &self.abort_on_delay)
            .field("illuminate_full_stack", &self.illuminate_full_stack)
            .field("metadata_devices", &self.metadata_devices)
            .field("drift", &self.drift.is_some())
            .finish()
    }
}

fn config_error(message: impl Into<String>) -> AcquisitionError {
    AcquisitionError::Configuration(message.into())
}

fn validate_row(index: usize, row: &Row, continuous: bool, devices: &DeviceSet) -> AcqResult<()> {
    for (axis, values) in row.axes() {
        let Some(stage) = devices.axis(axis) else {
            return Err(config_error(format!(
                "row {index} drives {axis} but no {axis} stage is assigned"
            )));
        };
        if axis != Axis::Z && !values.is_fixed() {
            return Err(config_error(format!(
                "row {index}: only Z may be a range, {axis} is '{values}'"
            )));
        }
        if axis == Axis::Z && values.is_continuous() && stage.velocity.is_none() {
            return Err(config_error(format!(
                "row {index} sweeps Z but stage '{}' has no velocity control",
                stage.id
            )));
        }
    }

    if row.is_z_continuous() && !continuous {
        return Err(config_error(format!(
            "row {index} sweeps Z, which requires continuous mode"
        )));
    }
    if continuous && row.is_z_stepped() {
        return Err(config_error(format!(
            "row {index} steps Z, which is not possible in continuous mode"
        )));
    }
    Ok(())
}
