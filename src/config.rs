//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SPIM_DAQ_`, with `__` separating
//!    nested keys
//!
//! # Example
//! ```no_run
//! use spim_daq::config::AppConfig;
//!
//! let config = AppConfig::load("config/acquisition.example.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), spim_daq::AcquisitionError>(())
//! ```
//!
//! `SPIM_DAQ_APPLICATION__LOG_LEVEL=debug` overrides `application.log_level`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::acquisition::{AcquisitionParams, OutputSink};
use crate::drift::{
    CentroidEstimator, CorrelationEstimator, OffsetEstimator, ProjectionDriftFactory,
    ReferencePolicy,
};
use crate::error::{AcqResult, AcquisitionError};
use crate::sequence::{Axis, AxisValueSet, DriftHandoff, Row};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SPIM_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Devices and their roles
    pub hardware: HardwareConfig,
    /// The acquisition to run
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Device declarations and role assignments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Every device, built through the driver registry
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Device id driving X
    #[serde(default)]
    pub x: Option<String>,
    /// Device id driving Y
    #[serde(default)]
    pub y: Option<String>,
    /// Device id driving Z
    #[serde(default)]
    pub z: Option<String>,
    /// Device id driving the rotation stage
    #[serde(default)]
    pub theta: Option<String>,
    /// Camera device id
    pub camera: String,
    /// Laser/shutter device id
    pub illumination: String,
}

impl HardwareConfig {
    /// Assigned axes in X, Y, Z, Theta order
    pub fn axis_assignments(&self) -> impl Iterator<Item = (Axis, &String)> {
        [
            (Axis::X, self.x.as_ref()),
            (Axis::Y, self.y.as_ref()),
            (Axis::Z, self.z.as_ref()),
            (Axis::Theta, self.theta.as_ref()),
        ]
        .into_iter()
        .filter_map(|(axis, id)| id.map(|id| (axis, id)))
    }

    /// Declared device by id
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier
    pub id: String,
    /// Driver type tag (e.g. "mock_stage")
    pub driver: String,
    /// Whether this device is built
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration (dynamic)
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

/// Acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Number of time points
    #[serde(default = "default_time_points")]
    pub time_points: usize,
    /// Seconds between time point starts
    #[serde(default)]
    pub interval_secs: f64,
    /// Stream from the camera instead of per-slice snaps
    #[serde(default)]
    pub continuous: bool,
    /// Wait after each motion before capture (ms)
    #[serde(default)]
    pub settle_delay_ms: u64,
    /// Watchdog timeout for hardware waits (ms)
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Abort when a hardware wait exceeds the watchdog timeout
    #[serde(default = "default_enabled")]
    pub abort_on_delay: bool,
    /// Keep the light on for whole stacks
    #[serde(default)]
    pub illuminate_full_stack: bool,
    /// Readable devices sampled into slice metadata
    #[serde(default)]
    pub metadata_devices: Vec<String>,
    /// Stage positions
    #[serde(default)]
    pub rows: Vec<RowConfig>,
    /// Drift compensation; absent disables it
    #[serde(default)]
    pub drift: Option<DriftSettings>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            time_points: default_time_points(),
            interval_secs: 0.0,
            continuous: false,
            settle_delay_ms: 0,
            step_timeout_ms: default_step_timeout_ms(),
            abort_on_delay: true,
            illuminate_full_stack: false,
            metadata_devices: Vec::new(),
            rows: Vec::new(),
            drift: None,
        }
    }
}

/// One row: axis programs in text form plus optional inversion overrides
///
/// ```toml
/// [[acquisition.rows]]
/// x = "1200"
/// z = "0:2:40"
/// invert_z = true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowConfig {
    /// X program
    #[serde(default)]
    pub x: Option<AxisValueSet>,
    /// Y program
    #[serde(default)]
    pub y: Option<AxisValueSet>,
    /// Z program
    #[serde(default)]
    pub z: Option<AxisValueSet>,
    /// Rotation program
    #[serde(default)]
    pub theta: Option<AxisValueSet>,
    /// Override the drift X inversion for this row
    #[serde(default)]
    pub invert_x: Option<bool>,
    /// Override the drift Y inversion for this row
    #[serde(default)]
    pub invert_y: Option<bool>,
    /// Override the drift Z inversion for this row
    #[serde(default)]
    pub invert_z: Option<bool>,
}

/// Offset estimator selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftMethod {
    /// FFT cross-power correlation of projections
    #[default]
    Correlation,
    /// Intensity-weighted centroid difference
    Centroid,
}

/// Drift compensation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftSettings {
    /// Estimator
    #[serde(default)]
    pub method: DriftMethod,
    /// Which stack later stacks are compared with
    #[serde(default)]
    pub reference: ReferencePolicy,
    /// Stage units (µm) per camera pixel
    #[serde(default = "default_pixel_size")]
    pub pixel_size_um: f64,
    /// Stage units per slice; each row's Z step when unset
    #[serde(default)]
    pub z_step_um: Option<f64>,
    /// Flip X corrections
    #[serde(default)]
    pub invert_x: bool,
    /// Flip Y corrections
    #[serde(default)]
    pub invert_y: bool,
    /// Flip Z corrections
    #[serde(default)]
    pub invert_z: bool,
}

// Default value functions
fn default_name() -> String {
    "spim-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn default_time_points() -> usize {
    1
}

fn default_step_timeout_ms() -> u64 {
    5000
}

fn default_pixel_size() -> f64 {
    1.0
}

impl AppConfig {
    /// Load from `path` and `SPIM_DAQ_` environment overrides, then validate
    pub fn load<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let config = Self::load_from(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` and the environment without validating
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack, for callers that want to merge more sources
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AcqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(AcquisitionError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for device in &self.hardware.devices {
            if !ids.insert(device.id.as_str()) {
                return Err(AcquisitionError::Configuration(format!(
                    "Duplicate device id: {}",
                    device.id
                )));
            }
        }

        let hardware = &self.hardware;
        let roles = hardware
            .axis_assignments()
            .map(|(axis, id)| (axis.name(), id))
            .chain([
                ("camera", &hardware.camera),
                ("illumination", &hardware.illumination),
            ]);
        for (role, id) in roles {
            match hardware.device(id) {
                Some(device) if device.enabled => {}
                Some(_) => {
                    return Err(AcquisitionError::Configuration(format!(
                        "{role} device '{id}' is disabled"
                    )))
                }
                None => {
                    return Err(AcquisitionError::Configuration(format!(
                        "{role} device '{id}' is not declared"
                    )))
                }
            }
        }

        for id in &self.acquisition.metadata_devices {
            if hardware.device(id).is_none() {
                return Err(AcquisitionError::Configuration(format!(
                    "metadata device '{id}' is not declared"
                )));
            }
        }

        self.acquisition.interval()?;

        if let Some(drift) = &self.acquisition.drift {
            if !(drift.pixel_size_um.is_finite() && drift.pixel_size_um > 0.0) {
                return Err(AcquisitionError::Configuration(
                    "drift.pixel_size_um must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

impl AcquisitionConfig {
    /// Rows with their drift hand-off metadata
    pub fn rows(&self) -> Vec<Row> {
        let base = self.drift.as_ref().map(DriftSettings::handoff).unwrap_or_default();
        self.rows.iter().map(|row| row.to_row(base)).collect()
    }

    /// Time point spacing; rejects negative, non-finite and oversized values
    pub fn interval(&self) -> AcqResult<Duration> {
        Duration::try_from_secs_f64(self.interval_secs).map_err(|e| {
            AcquisitionError::Configuration(format!(
                "interval_secs = {} is not a valid duration: {e}",
                self.interval_secs
            ))
        })
    }

    /// Build run parameters writing to `sink`
    pub fn to_params(&self, sink: Arc<dyn OutputSink>) -> AcqResult<AcquisitionParams> {
        let mut params = AcquisitionParams::new(self.rows(), sink)
            .with_time_points(self.time_points)
            .with_interval(self.interval()?)
            .with_continuous(self.continuous)
            .with_settle_delay(Duration::from_millis(self.settle_delay_ms))
            .with_step_timeout(Duration::from_millis(self.step_timeout_ms))
            .with_abort_on_delay(self.abort_on_delay)
            .with_full_stack_illumination(self.illuminate_full_stack)
            .with_metadata_devices(self.metadata_devices.clone());
        if let Some(drift) = &self.drift {
            params = params.with_drift(Arc::new(drift.factory()));
        }
        Ok(params)
    }
}

impl RowConfig {
    /// Build the row, applying inversion overrides to `base`
    pub fn to_row(&self, base: DriftHandoff) -> Row {
        let mut handoff = base;
        handoff.invert_x = self.invert_x.unwrap_or(base.invert_x);
        handoff.invert_y = self.invert_y.unwrap_or(base.invert_y);
        handoff.invert_z = self.invert_z.unwrap_or(base.invert_z);

        let mut row = Row::new().with_handoff(handoff);
        for (axis, values) in [
            (Axis::X, self.x),
            (Axis::Y, self.y),
            (Axis::Z, self.z),
            (Axis::Theta, self.theta),
        ] {
            if let Some(values) = values {
                row = row.with(axis, values);
            }
        }
        row
    }
}

impl DriftSettings {
    /// Hand-off scale and orientation shared by every row
    pub fn handoff(&self) -> DriftHandoff {
        DriftHandoff {
            invert_x: self.invert_x,
            invert_y: self.invert_y,
            invert_z: self.invert_z,
            pixel_size: self.pixel_size_um,
            z_step: self.z_step_um,
        }
    }

    /// Controller factory for these settings
    pub fn factory(&self) -> ProjectionDriftFactory {
        let estimator: Arc<dyn OffsetEstimator> = match self.method {
            DriftMethod::Correlation => Arc::new(CorrelationEstimator::new()),
            DriftMethod::Centroid => Arc::new(CentroidEstimator::new()),
        };
        ProjectionDriftFactory::new(estimator).with_policy(self.reference)
    }
}
