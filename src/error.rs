//! Error types for acquisition runs.
//!
//! Drivers and capability traits report failures as `anyhow::Error`; the
//! orchestrator lifts those into [`AcquisitionError`] with the device id and
//! operation attached (see [`DeviceResultExt`]), so a caller can tell a
//! rejected configuration from a hardware fault or a cooperative abort.
//!
//! ## Categories
//!
//! - **Configuration**: `AlreadyRunning`, `Configuration`,
//!   `ContinuousWithDrift`, `ConfigLoad`. Raised before any device is
//!   touched.
//! - **Device**: `Device`, always fatal to the run.
//! - **Timing and cancellation**: `Cancelled`, `Timeout`.
//! - **Background capture**: `CaptureWorker`, `CaptureWorkerExited`.
//! - **Output**: `Output`, raised by the sink.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcquisitionError>;

/// Acquisition error.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// A run is already in progress on this orchestrator
    #[error("Acquisition already running")]
    AlreadyRunning,

    /// Parameters or configuration rejected before the run started
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Continuous capture and drift compensation were both requested
    #[error("Continuous capture and drift compensation are mutually exclusive")]
    ContinuousWithDrift,

    /// A device operation failed
    #[error("Device '{device}' failed during {operation}: {source:#}")]
    Device {
        /// Device id
        device: String,
        /// Operation in progress
        operation: &'static str,
        /// Underlying driver error
        source: anyhow::Error,
    },

    /// The run was cancelled
    #[error("Acquisition cancelled")]
    Cancelled,

    /// A bounded hardware wait did not finish in time
    #[error("Hardware wait exceeded {0:?}")]
    Timeout(Duration),

    /// The continuous-capture worker reported an error
    #[error("Continuous capture failed: {0:#}")]
    CaptureWorker(anyhow::Error),

    /// The continuous-capture worker ended without being asked to
    #[error("Continuous capture worker exited unexpectedly")]
    CaptureWorkerExited,

    /// The output sink failed
    #[error("Output error: {0:#}")]
    Output(anyhow::Error),

    /// Loading configuration failed
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),
}

impl AcquisitionError {
    /// Whether the error was raised before any hardware was touched
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AcquisitionError::AlreadyRunning
                | AcquisitionError::Configuration(_)
                | AcquisitionError::ContinuousWithDrift
                | AcquisitionError::ConfigLoad(_)
        )
    }

    /// Whether the error is a cooperative stop (cancel or watchdog)
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            AcquisitionError::Cancelled | AcquisitionError::Timeout(_)
        )
    }
}

impl From<figment::Error> for AcquisitionError {
    fn from(err: figment::Error) -> Self {
        AcquisitionError::ConfigLoad(Box::new(err))
    }
}

/// Attach device context to driver results.
///
/// ```rust,ignore
/// stage.movable.move_abs(10.0).await.device(&stage.id, "move")?;
/// ```
pub trait DeviceResultExt<T> {
    /// Wrap an error as [`AcquisitionError::Device`]
    fn device(self, device: &str, operation: &'static str) -> AcqResult<T>;
}

impl<T> DeviceResultExt<T> for anyhow::Result<T> {
    fn device(self, device: &str, operation: &'static str) -> AcqResult<T> {
        self.map_err(|source| AcquisitionError::Device {
            device: device.to_string(),
            operation,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_context_is_rendered() {
        let result: anyhow::Result<()> = Err(anyhow::anyhow!("port closed"));
        let err = result.device("stage_z", "move").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Device 'stage_z' failed during move: port closed"
        );
        assert!(!err.is_configuration());
    }

    #[test]
    fn categories() {
        assert!(AcquisitionError::ContinuousWithDrift.is_configuration());
        assert!(AcquisitionError::AlreadyRunning.is_configuration());
        assert!(AcquisitionError::Timeout(Duration::from_secs(5)).is_interruption());
        assert!(!AcquisitionError::CaptureWorkerExited.is_interruption());
    }
}
